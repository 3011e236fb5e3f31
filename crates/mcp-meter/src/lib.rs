//! Metered proxy core for MCP servers.
//!
//! Every inbound call walks the same pipeline: resolve the caller's API key
//! to a [`Principal`], check that the target server passed its compliance
//! handshake, price the operation, admit it against the caller's prepaid
//! wallet, dispatch it upstream, then bill and record a [`UsageEvent`].
//!
//! # Seams
//!
//! Storage and transport are traits in [`backend`] so the orchestrator in
//! [`pipeline`] can run against SQLite and HTTP in the gateway binary, or
//! against [`memory::InMemoryBackend`] in tests.
//!
//! - [`PrincipalResolver`]: credential digest to principal
//! - [`ServerCatalog`] / [`ComplianceGate`]: server lookup and last known status
//! - [`WalletLedger`]: balance reads and atomic conditional debits
//! - [`UsageRecorder`]: append-only usage log
//! - [`Dispatcher`]: forwards the request body to the upstream

pub mod backend;
pub mod credential;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod pricing;
pub mod types;

pub use backend::{
    ComplianceGate, DispatchFailure, Dispatcher, MeterStore, PrincipalResolver, ServerCatalog,
    UpstreamResponse, UsageRecorder, WalletLedger,
};
pub use credential::{generate_api_key, parse_bearer, CredentialHasher};
pub use error::{LedgerError, MeterError};
pub use pipeline::{InboundCall, Orchestrator, Settlement, Stage};
pub use pricing::{price, price_operation, DEFAULT_COST, TOOL_CALL_METHOD};
pub use types::*;
