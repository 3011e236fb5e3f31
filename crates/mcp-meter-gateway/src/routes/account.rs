use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::auth::authenticate;
use crate::error::GatewayError;
use crate::state::AppState;

const DEFAULT_USAGE_LIMIT: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /whoami - Echo the authenticated principal
pub async fn whoami(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let principal = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Authentication successful",
        "user": principal,
    })))
}

/// GET /wallet - Caller's credit balance
pub async fn wallet(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let principal = authenticate(&req, &state).await?;
    let user_id = principal.id.clone();
    let balance = state
        .db
        .run_blocking(move |db| db.balance(&user_id))
        .await?
        .ok_or_else(|| mcp_meter::MeterError::WalletNotFound(principal.id.clone()))?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "user_id": principal.id,
        "balance": balance,
    })))
}

/// GET /usage - Caller's usage events, newest first
pub async fn usage(
    req: HttpRequest,
    query: web::Query<UsageQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let principal = authenticate(&req, &state).await?;
    let limit = query.limit.unwrap_or(DEFAULT_USAGE_LIMIT).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);
    let user_id = principal.id.clone();

    let events = state
        .db
        .run_blocking(move |db| db.list_usage(&user_id, limit, offset))
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "events": events,
        "limit": limit,
        "offset": offset,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/whoami", web::get().to(whoami))
        .route("/wallet", web::get().to(wallet))
        .route("/usage", web::get().to(usage));
}
