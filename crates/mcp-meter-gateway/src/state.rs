use std::sync::Arc;

use mcp_meter::{CredentialHasher, Orchestrator};

use crate::config::GatewayConfig;
use crate::db::Database;
use crate::dispatch::HttpDispatcher;
use crate::error::GatewayError;

pub type Gateway = Orchestrator<Database, HttpDispatcher>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub db: Database,
    pub http_client: reqwest::Client,
    pub hasher: CredentialHasher,
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(config: GatewayConfig, db: Database) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none()) // Prevent SSRF via redirects
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {e}")))?;

        let hasher = CredentialHasher::new(&config.credential_pepper)
            .map_err(|e| GatewayError::Internal(format!("invalid credential pepper: {e}")))?;

        let dispatcher = HttpDispatcher::new(http_client.clone(), config.allow_private_upstreams);
        let gateway = Orchestrator::new(db.clone(), dispatcher, hasher.clone());

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            hasher,
            gateway,
        })
    }
}
