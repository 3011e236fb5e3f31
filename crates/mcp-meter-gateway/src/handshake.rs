//! One-shot compliance probe.
//!
//! Sends an MCP `initialize` request to a registered server and decides
//! whether it may receive metered traffic. The result is persisted by the
//! caller; the proxy path only ever reads the stored status.

use std::time::Duration;

use mcp_meter::ComplianceStatus;
use serde::Deserialize;

use crate::validation::ensure_public_host;

/// Upper bound on the handshake reply we are willing to parse.
const MAX_HANDSHAKE_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub status: ComplianceStatus,
    pub message: String,
}

impl HandshakeOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ComplianceStatus::Failed,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct InitializeReply {
    name: Option<serde_json::Value>,
    version: Option<serde_json::Value>,
}

/// Decide compliance from a 2xx reply body.
fn evaluate(body: &[u8]) -> HandshakeOutcome {
    let reply: InitializeReply = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => {
            return HandshakeOutcome::failed(
                "Server responded but response was not a valid MCP initialize response.",
            )
        }
    };

    let text = |v: &Option<serde_json::Value>| {
        v.as_ref()
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (text(&reply.name), text(&reply.version)) {
        (Some(name), Some(_)) => HandshakeOutcome {
            status: ComplianceStatus::Passed,
            message: format!("Handshake successful. Server Name: {}", name),
        },
        _ => HandshakeOutcome::failed(
            "Server responded but response was not a valid MCP initialize response.",
        ),
    }
}

/// Probe `url` with an `initialize` request. Never fails: every transport or
/// protocol problem becomes a `FAILED` outcome with an explanatory message.
pub async fn probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    allow_private: bool,
) -> HandshakeOutcome {
    let parsed = match url::Url::parse(url) {
        Ok(u) => u,
        Err(_) => return HandshakeOutcome::failed("Server URL is invalid."),
    };
    if !allow_private {
        if let Err(e) = ensure_public_host(&parsed).await {
            tracing::warn!(url = %url, error = %e, "handshake target rejected");
            return HandshakeOutcome::failed("Could not reach server URL.");
        }
    }

    let response = client
        .post(parsed)
        .timeout(timeout)
        .json(&serde_json::json!({ "method": "initialize" }))
        .send()
        .await;

    let mut response = match response {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "handshake request failed");
            return HandshakeOutcome::failed("Could not reach server URL.");
        }
    };

    let status = response.status();
    if !status.is_success() {
        return HandshakeOutcome::failed(format!(
            "Server responded with status: {}",
            status.as_u16()
        ));
    }
    if response
        .content_length()
        .is_some_and(|cl| cl > MAX_HANDSHAKE_BODY as u64)
    {
        return HandshakeOutcome::failed("Server handshake response was too large.");
    }

    // Enforce the cap per chunk; chunked replies carry no Content-Length.
    let mut body = Vec::with_capacity(8192);
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > MAX_HANDSHAKE_BODY {
                    tracing::warn!(url = %url, "handshake response exceeded size limit");
                    return HandshakeOutcome::failed("Server handshake response was too large.");
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "failed to read handshake response");
                return HandshakeOutcome::failed("Could not reach server URL.");
            }
        }
    }
    evaluate(&body)
}
