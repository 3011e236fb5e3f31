use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeterError;
use crate::pricing::TOOL_CALL_METHOD;

/// Prepaid credit amount. Balances and prices are whole credits.
pub type Credits = i64;

/// The authenticated identity behind a request.
///
/// Lives for a single request only; it is threaded through the pipeline
/// rather than attached to the inbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
    /// Id of the API key that authenticated this request.
    pub api_key_id: String,
}

/// A stored API key row as seen by the principal resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_id: String,
    /// Hex digest of the raw key (never the key itself).
    pub key_hash: String,
    pub revoked: bool,
    pub user_id: String,
    pub email: String,
    pub is_admin: bool,
}

impl KeyRecord {
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.user_id.clone(),
            email: self.email.clone(),
            is_admin: self.is_admin,
            api_key_id: self.key_id.clone(),
        }
    }
}

/// Result of the last compliance handshake against an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    Unverified,
    Passed,
    Failed,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Unverified => "UNVERIFIED",
            ComplianceStatus::Passed => "PASSED",
            ComplianceStatus::Failed => "FAILED",
        }
    }

    /// Only `PASSED` servers may receive proxied traffic.
    pub fn admits_traffic(&self) -> bool {
        matches!(self, ComplianceStatus::Passed)
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNVERIFIED" => Ok(ComplianceStatus::Unverified),
            "PASSED" => Ok(ComplianceStatus::Passed),
            "FAILED" => Ok(ComplianceStatus::Failed),
            other => Err(format!("unknown compliance status: {other}")),
        }
    }
}

/// A registered upstream MCP server and its rate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamServer {
    pub id: String,
    pub owner_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: String,
    pub compliance_status: ComplianceStatus,
    /// Per-request price; `None` falls back to [`crate::DEFAULT_COST`].
    pub base_price: Option<Credits>,
    /// Tool-specific overrides keyed by exact (case-sensitive) tool name.
    #[serde(default)]
    pub tool_prices: HashMap<String, Credits>,
    pub created_at: i64,
}

/// What the gateway did about billing for a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingOutcome {
    /// Upstream succeeded and the wallet was debited.
    Charged,
    /// Upstream did not succeed, so nothing was debited.
    NotCharged,
    /// Upstream succeeded but the debit failed; needs reconciliation.
    Failed,
}

impl BillingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingOutcome::Charged => "charged",
            BillingOutcome::NotCharged => "not_charged",
            BillingOutcome::Failed => "failed",
        }
    }
}

impl FromStr for BillingOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charged" => Ok(BillingOutcome::Charged),
            "not_charged" => Ok(BillingOutcome::NotCharged),
            "failed" => Ok(BillingOutcome::Failed),
            other => Err(format!("unknown billing outcome: {other}")),
        }
    }
}

/// Immutable audit record for one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub user_id: String,
    pub server_id: String,
    pub api_key_id: String,
    pub cost: Credits,
    pub is_success: bool,
    pub billing: BillingOutcome,
    pub gateway_request_id: String,
    /// `None` when the upstream was never reached.
    pub upstream_status: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

/// The part of an inbound request body that drives pricing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub method: String,
    pub tool_name: Option<String>,
}

impl Operation {
    /// Extract the operation from a JSON request body.
    ///
    /// The tool name is read from a top-level `tool_name`, falling back to the
    /// JSON-RPC `params.name` field, and only for `tools/call`.
    pub fn from_body(body: &[u8]) -> Result<Self, MeterError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| MeterError::MalformedRequest(format!("body is not valid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| MeterError::MalformedRequest("body must be a JSON object".into()))?;
        let method = object
            .get("method")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| MeterError::MalformedRequest("missing string field 'method'".into()))?
            .to_string();

        let tool_name = if method == TOOL_CALL_METHOD {
            object
                .get("tool_name")
                .and_then(|t| t.as_str())
                .or_else(|| {
                    object
                        .get("params")
                        .and_then(|p| p.get("name"))
                        .and_then(|n| n.as_str())
                })
                .map(String::from)
        } else {
            None
        };

        Ok(Self { method, tool_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compliance_status_roundtrip() {
        for status in [
            ComplianceStatus::Unverified,
            ComplianceStatus::Passed,
            ComplianceStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ComplianceStatus>().unwrap(), status);
        }
        assert!("passed".parse::<ComplianceStatus>().is_err());
        assert!(ComplianceStatus::Passed.admits_traffic());
        assert!(!ComplianceStatus::Unverified.admits_traffic());
        assert!(!ComplianceStatus::Failed.admits_traffic());
    }

    #[test]
    fn test_operation_top_level_tool_name() {
        let op = Operation::from_body(br#"{"method":"tools/call","tool_name":"search"}"#).unwrap();
        assert_eq!(op.method, "tools/call");
        assert_eq!(op.tool_name.as_deref(), Some("search"));
    }

    #[test]
    fn test_operation_jsonrpc_params_name() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"fetch","arguments":{}}}"#;
        let op = Operation::from_body(body).unwrap();
        assert_eq!(op.tool_name.as_deref(), Some("fetch"));
    }

    #[test]
    fn test_operation_tool_name_ignored_for_other_methods() {
        let op = Operation::from_body(br#"{"method":"tools/list","tool_name":"search"}"#).unwrap();
        assert_eq!(op.method, "tools/list");
        assert!(op.tool_name.is_none());
    }

    #[test]
    fn test_operation_rejects_malformed_bodies() {
        assert!(matches!(
            Operation::from_body(b"not json"),
            Err(MeterError::MalformedRequest(_))
        ));
        assert!(matches!(
            Operation::from_body(b"[1,2]"),
            Err(MeterError::MalformedRequest(_))
        ));
        assert!(matches!(
            Operation::from_body(br#"{"method":42}"#),
            Err(MeterError::MalformedRequest(_))
        ));
        assert!(matches!(
            Operation::from_body(br#"{"params":{}}"#),
            Err(MeterError::MalformedRequest(_))
        ));
    }
}
