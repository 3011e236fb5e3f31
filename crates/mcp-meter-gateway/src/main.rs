use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_meter_gateway::{
    config::GatewayConfig, db::Database, metrics::register_metrics, routes, state::AppState,
};

fn startup_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    tracing::error!("{}: {}", context, e);
    std::io::Error::other(format!("{context}: {e}"))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config =
        GatewayConfig::from_env().map_err(|e| startup_error("Failed to load configuration", e))?;
    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();
    let rate_limit_rpm = config.rate_limit_rpm;
    let max_body_bytes = config.max_body_bytes;

    tracing::info!("Starting mcp-meter-gateway on port {}", port);
    tracing::info!("Upstream timeout: {:?}", config.upstream_timeout);

    // Initialize database
    let db = Database::new(&config.db_path, config.db_pool_size)
        .map_err(|e| startup_error("Failed to initialize database", e))?;
    tracing::info!(
        "Database initialized at: {} (pool size {})",
        config.db_path,
        config.db_pool_size
    );

    // Register Prometheus metrics
    register_metrics();

    // Create shared state
    let state = AppState::new(config, db).map_err(|e| startup_error("Failed to build state", e))?;

    if let (Some(email), Some(key)) = (
        state.config.bootstrap_admin_email.clone(),
        state.config.bootstrap_admin_key.as_deref(),
    ) {
        let key_hash = state.hasher.digest(key);
        let created = state
            .db
            .run_blocking({
                let email = email.clone();
                move |db| db.bootstrap_admin(&email, &key_hash)
            })
            .await
            .map_err(|e| startup_error("Failed to bootstrap admin", e))?;
        if created {
            tracing::info!(email = %email, "Bootstrap admin created");
        }
    }

    let state_data = web::Data::new(state);

    // Configure rate limiter
    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm as u64)
        .finish()
        .ok_or_else(|| startup_error("Failed to create rate limiter config", "invalid rate"))?;

    // Start HTTP server
    HttpServer::new(move || {
        let cors = mcp_meter_gateway::cors::build_cors(&allowed_origins);

        App::new()
            .app_data(state_data.clone())
            .app_data(routes::json_config(max_body_bytes))
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Governor::new(&governor_conf))
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
