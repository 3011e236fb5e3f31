use actix_web::HttpRequest;
use mcp_meter::{MeterError, Principal};

use crate::error::GatewayError;
use crate::state::AppState;

/// Raw `Authorization` header, if present and valid UTF-8.
pub fn authorization_header(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve the caller's API key to a principal.
pub async fn authenticate(req: &HttpRequest, state: &AppState) -> Result<Principal, GatewayError> {
    let header = authorization_header(req);
    Ok(state.gateway.authenticate(header.as_deref()).await?)
}

/// Authenticate and additionally require the admin flag.
pub async fn require_admin(req: &HttpRequest, state: &AppState) -> Result<Principal, GatewayError> {
    let principal = authenticate(req, state).await?;
    if !principal.is_admin {
        tracing::warn!(user_id = %principal.id, path = %req.path(), "non-admin denied");
        return Err(MeterError::Forbidden.into());
    }
    Ok(principal)
}
