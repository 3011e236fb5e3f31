use actix_web::{web, HttpRequest, HttpResponse};
use mcp_meter::MeterError;

use crate::auth::authenticate;
use crate::db::RegisterServer;
use crate::error::GatewayError;
use crate::metrics::SERVERS_REGISTERED;
use crate::state::AppState;
use crate::validation::{validate_registration, validate_upstream_url};

/// POST /servers - Register an upstream server with its price table
///
/// The caller becomes the owner. The server starts UNVERIFIED and receives no
/// traffic until an admin runs the compliance handshake.
pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterServer>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let principal = authenticate(&req, &state).await?;

    // Validate inputs before touching storage
    validate_upstream_url(&body.url, state.config.allow_private_upstreams)?;
    validate_registration(&body)?;

    let registration = body.into_inner();
    let owner_id = principal.id.clone();
    let server = state
        .db
        .run_blocking(move |db| db.register_server(&owner_id, &registration))
        .await?;

    SERVERS_REGISTERED.inc();
    tracing::info!(
        server_id = %server.id,
        owner_id = %principal.id,
        tools = server.tool_prices.len(),
        "server registered"
    );

    Ok(HttpResponse::Created().json(serde_json::json!({
        "success": true,
        "server": server,
    })))
}

/// GET /servers/{id} - Server details, status and price table
pub async fn get_server(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    authenticate(&req, &state).await?;
    let server_id = path.into_inner();
    let lookup_id = server_id.clone();

    let server = state
        .db
        .run_blocking(move |db| db.get_server(&lookup_id))
        .await?
        .ok_or(MeterError::ServerNotFound(server_id))?;

    Ok(HttpResponse::Ok().json(server))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/servers", web::post().to(register))
        .route("/servers/{id}", web::get().to(get_server));
}
