use thiserror::Error;

use crate::types::{ComplianceStatus, Credits};

/// Errors that end a request before (or instead of) a relayed upstream response.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("missing or malformed Authorization header")]
    Unauthenticated,

    /// Unknown key and revoked key are deliberately indistinguishable.
    #[error("invalid API key")]
    InvalidCredential,

    #[error("administrator access required")]
    Forbidden,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server is not available (status: {0})")]
    ServerNotCompliant(ComplianceStatus),

    #[error("wallet not found for user {0}")]
    WalletNotFound(String),

    #[error("insufficient credits: balance {balance}, cost {cost}")]
    InsufficientFunds { balance: Credits, cost: Credits },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream returned a malformed response: {0}")]
    UpstreamMalformedResponse(String),

    #[error("billing failed: {0}")]
    BillingFailure(String),

    #[error("usage recording failed: {0}")]
    RecordingFailure(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeterError {
    /// Stable snake_case label, used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MeterError::Unauthenticated => "unauthenticated",
            MeterError::InvalidCredential => "invalid_credential",
            MeterError::Forbidden => "forbidden",
            MeterError::MalformedRequest(_) => "malformed_request",
            MeterError::ServerNotFound(_) => "server_not_found",
            MeterError::ServerNotCompliant(_) => "server_not_compliant",
            MeterError::WalletNotFound(_) => "wallet_not_found",
            MeterError::InsufficientFunds { .. } => "insufficient_funds",
            MeterError::UpstreamUnreachable(_) => "upstream_unreachable",
            MeterError::UpstreamTimeout => "upstream_timeout",
            MeterError::UpstreamMalformedResponse(_) => "upstream_malformed_response",
            MeterError::BillingFailure(_) => "billing_failure",
            MeterError::RecordingFailure(_) => "recording_failure",
            MeterError::Storage(_) => "storage",
            MeterError::Internal(_) => "internal",
        }
    }
}

/// Outcome of a wallet operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("wallet not found")]
    WalletNotFound,

    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Lift a ledger error into the request-level taxonomy.
    pub fn into_meter_error(self, user_id: &str) -> MeterError {
        match self {
            LedgerError::WalletNotFound => MeterError::WalletNotFound(user_id.to_string()),
            LedgerError::InsufficientFunds => MeterError::BillingFailure("insufficient funds".into()),
            LedgerError::Storage(msg) => MeterError::Storage(msg),
        }
    }
}
