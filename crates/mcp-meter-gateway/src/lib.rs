//! HTTP service for the metered MCP gateway.
//!
//! Wires the `mcp_meter` pipeline to SQLite storage, an HTTP dispatcher and
//! actix-web routes.

pub mod auth;
pub mod config;
pub mod cors;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod validation;

pub use config::GatewayConfig;
pub use db::Database;
pub use dispatch::{HttpDispatcher, REQUEST_ID_HEADER};
pub use error::GatewayError;
pub use state::AppState;
