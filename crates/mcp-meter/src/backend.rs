//! Collaborator traits for the metered pipeline.
//!
//! All methods are async I/O from the orchestrator's point of view. The only
//! mutual exclusion the pipeline relies on is [`WalletLedger::debit`], which
//! implementations must make atomic at the storage layer.

use std::future::Future;

use bytes::Bytes;

use crate::error::{LedgerError, MeterError};
use crate::types::{ComplianceStatus, Credits, KeyRecord, UpstreamServer, UsageEvent};

/// Maps a credential digest to its stored key row.
pub trait PrincipalResolver: Send + Sync {
    /// Look up a key by digest. Revoked keys are returned with `revoked = true`;
    /// the orchestrator decides how to treat them.
    fn find_key(
        &self,
        key_digest: &str,
    ) -> impl Future<Output = Result<Option<KeyRecord>, MeterError>> + Send;
}

/// Server-by-id lookup including the price table.
pub trait ServerCatalog: Send + Sync {
    fn server(
        &self,
        server_id: &str,
    ) -> impl Future<Output = Result<Option<UpstreamServer>, MeterError>> + Send;
}

/// Read-only view of the last handshake result for a server.
pub trait ComplianceGate: Send + Sync {
    fn status(
        &self,
        server_id: &str,
    ) -> impl Future<Output = Result<Option<ComplianceStatus>, MeterError>> + Send;
}

/// Prepaid credit balances.
pub trait WalletLedger: Send + Sync {
    fn balance(&self, user_id: &str) -> impl Future<Output = Result<Credits, LedgerError>> + Send;

    /// Atomically subtract `amount` if and only if the balance covers it.
    /// Returns the new balance. Must never drive a balance negative and must
    /// never lose a concurrent debit.
    fn debit(
        &self,
        user_id: &str,
        amount: Credits,
    ) -> impl Future<Output = Result<Credits, LedgerError>> + Send;
}

/// Append-only usage log.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, event: &UsageEvent) -> impl Future<Output = Result<(), MeterError>> + Send;
}

/// Everything the orchestrator needs from storage, cloneable into a spawned task.
pub trait MeterStore:
    PrincipalResolver + ServerCatalog + ComplianceGate + WalletLedger + UsageRecorder + Clone + 'static
{
}

impl<T> MeterStore for T where
    T: PrincipalResolver
        + ServerCatalog
        + ComplianceGate
        + WalletLedger
        + UsageRecorder
        + Clone
        + 'static
{
}

/// A relayed upstream reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Headers safe to relay to the caller.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Structured dispatch failure; transport errors never escape as panics or
/// opaque errors so the call can still be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    Unreachable(String),
    Timeout,
    Malformed(String),
}

impl From<DispatchFailure> for MeterError {
    fn from(f: DispatchFailure) -> Self {
        match f {
            DispatchFailure::Unreachable(msg) => MeterError::UpstreamUnreachable(msg),
            DispatchFailure::Timeout => MeterError::UpstreamTimeout,
            DispatchFailure::Malformed(msg) => MeterError::UpstreamMalformedResponse(msg),
        }
    }
}

/// Forwards a request body to an upstream server.
pub trait Dispatcher: Send + Sync + Clone + 'static {
    fn forward(
        &self,
        server: &UpstreamServer,
        body: Bytes,
        request_id: &str,
    ) -> impl Future<Output = Result<UpstreamResponse, DispatchFailure>> + Send;
}
