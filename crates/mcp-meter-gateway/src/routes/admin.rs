use actix_web::{web, HttpRequest, HttpResponse};
use mcp_meter::{generate_api_key, Credits, MeterError};
use serde::Deserialize;

use crate::auth::require_admin;
use crate::error::GatewayError;
use crate::handshake;
use crate::state::AppState;

/// Largest single top-up accepted. Cumulative overflow is refused in `Database::add_credits`.
const MAX_TOP_UP: Credits = 1_000_000_000_000;

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub initial_credits: Credits,
}

#[derive(Debug, Deserialize)]
pub struct AddCredits {
    pub user_id: String,
    pub amount: Credits,
}

fn validate_email(email: &str) -> Result<(), GatewayError> {
    let valid = email.len() <= 254
        && !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::BadRequest("invalid email address".to_string()))
    }
}

/// POST /admin/users - Create a user with a wallet and a first API key
pub async fn create_user(
    req: HttpRequest,
    body: web::Json<CreateUser>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_admin(&req, &state).await?;
    validate_email(&body.email)?;
    if !(0..=MAX_TOP_UP).contains(&body.initial_credits) {
        return Err(GatewayError::InvalidPrice(
            "initial_credits must be between 0 and 1000000000000".to_string(),
        ));
    }

    let api_key = generate_api_key();
    let key_hash = state.hasher.digest(&api_key);
    let CreateUser {
        email,
        is_admin,
        initial_credits,
    } = body.into_inner();

    let (user, key_id) = state
        .db
        .run_blocking(move |db| db.create_user(&email, is_admin, initial_credits, &key_hash))
        .await?;

    tracing::info!(
        admin_id = %admin.id,
        user_id = %user.id,
        key_id = %key_id,
        is_admin = user.is_admin,
        "user created"
    );

    // The raw key is returned exactly once and never stored.
    Ok(HttpResponse::Created().json(serde_json::json!({
        "user": user,
        "balance": initial_credits,
        "api_key": api_key,
        "api_key_id": key_id,
    })))
}

/// POST /admin/users/{id}/keys - Issue an additional API key
pub async fn issue_key(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_admin(&req, &state).await?;
    let user_id = path.into_inner();
    let api_key = generate_api_key();
    let key_hash = state.hasher.digest(&api_key);

    let owner = user_id.clone();
    let key_id = state
        .db
        .run_blocking(move |db| db.issue_key(&owner, &key_hash))
        .await?;

    tracing::info!(admin_id = %admin.id, user_id = %user_id, key_id = %key_id, "API key issued");

    Ok(HttpResponse::Created().json(serde_json::json!({
        "user_id": user_id,
        "api_key": api_key,
        "api_key_id": key_id,
    })))
}

/// POST /admin/keys/{id}/revoke - Revoke an API key
pub async fn revoke_key(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_admin(&req, &state).await?;
    let key_id = path.into_inner();
    let target = key_id.clone();
    state
        .db
        .run_blocking(move |db| db.revoke_key(&target))
        .await?;

    tracing::info!(admin_id = %admin.id, key_id = %key_id, "API key revoked");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "api_key_id": key_id,
        "revoked": true,
    })))
}

/// POST /admin/credits - Top up a user's wallet
pub async fn add_credits(
    req: HttpRequest,
    body: web::Json<AddCredits>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_admin(&req, &state).await?;
    if body.amount <= 0 || body.amount > MAX_TOP_UP {
        return Err(GatewayError::InvalidPrice(
            "amount must be a positive number of credits".to_string(),
        ));
    }

    let AddCredits { user_id, amount } = body.into_inner();
    let target = user_id.clone();
    let balance = state
        .db
        .run_blocking(move |db| db.add_credits(&target, amount))
        .await?;

    tracing::info!(admin_id = %admin.id, user_id = %user_id, amount, balance, "credits added");

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "user_id": user_id,
        "added": amount,
        "balance": balance,
    })))
}

/// POST /admin/servers/{id}/validate - Run the compliance handshake
pub async fn validate_server(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_admin(&req, &state).await?;
    let server_id = path.into_inner();

    let lookup_id = server_id.clone();
    let server = state
        .db
        .run_blocking(move |db| db.get_server(&lookup_id))
        .await?
        .ok_or_else(|| MeterError::ServerNotFound(server_id.clone()))?;

    let outcome = handshake::probe(
        &state.http_client,
        &server.url,
        state.config.handshake_timeout,
        state.config.allow_private_upstreams,
    )
    .await;

    let target = server_id.clone();
    let new_status = outcome.status;
    state
        .db
        .run_blocking(move |db| db.set_compliance_status(&target, new_status))
        .await?;

    tracing::info!(
        admin_id = %admin.id,
        server_id = %server_id,
        status = %outcome.status,
        "compliance handshake completed"
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "server_id": server_id,
        "new_status": outcome.status,
        "message": outcome.message,
    })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/users", web::post().to(create_user))
            .route("/users/{id}/keys", web::post().to(issue_key))
            .route("/keys/{id}/revoke", web::post().to(revoke_key))
            .route("/credits", web::post().to(add_credits))
            .route("/servers/{id}/validate", web::post().to(validate_server)),
    );
}
