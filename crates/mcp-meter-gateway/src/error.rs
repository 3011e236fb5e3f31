use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use mcp_meter::MeterError;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// Metering pipeline or policy error
    Meter(MeterError),
    /// Database error
    Database(String),
    /// Unique constraint violated
    Conflict(String),
    /// Invalid upstream URL
    InvalidUrl(String),
    /// Invalid price or credit amount
    InvalidPrice(String),
    /// Malformed admin or registration payload
    BadRequest(String),
    /// User not found
    UserNotFound(String),
    /// API key not found
    KeyNotFound(String),
    /// Inbound body exceeds the configured limit
    PayloadTooLarge(usize),
    /// Internal error
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Meter(e) => write!(f, "{}", e),
            GatewayError::Database(e) => write!(f, "database error: {}", e),
            GatewayError::Conflict(msg) => write!(f, "conflict: {}", msg),
            GatewayError::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
            GatewayError::InvalidPrice(msg) => write!(f, "invalid price: {}", msg),
            GatewayError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            GatewayError::UserNotFound(id) => write!(f, "user not found: {}", id),
            GatewayError::KeyNotFound(id) => write!(f, "API key not found: {}", id),
            GatewayError::PayloadTooLarge(max) => {
                write!(f, "request body exceeds {} bytes", max)
            }
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<MeterError> for GatewayError {
    fn from(e: MeterError) -> Self {
        GatewayError::Meter(e)
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
            if err.extended_code == 2067 || err.extended_code == 1555 {
                return GatewayError::Conflict("record already exists".to_string());
            }
        }
        GatewayError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(e: r2d2::Error) -> Self {
        GatewayError::Database(format!("connection pool: {}", e))
    }
}

impl From<GatewayError> for MeterError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Meter(inner) => inner,
            other => MeterError::Storage(other.to_string()),
        }
    }
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({
        "error": code,
        "message": message.into(),
    }))
}

fn meter_error_response(e: &MeterError) -> HttpResponse {
    match e {
        MeterError::Unauthenticated => json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing or invalid Authorization header",
        ),
        // Same body for unknown and revoked keys.
        MeterError::InvalidCredential => {
            json_error(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid API key")
        }
        MeterError::Forbidden => json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "Administrator access required",
        ),
        MeterError::MalformedRequest(msg) => {
            json_error(StatusCode::BAD_REQUEST, "malformed_request", msg.clone())
        }
        MeterError::ServerNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "server_not_found",
            format!("Server '{}' not found", id),
        ),
        MeterError::ServerNotCompliant(status) => HttpResponse::Forbidden().json(serde_json::json!({
            "error": "server_not_compliant",
            "message": format!("Server is not available (Status: {})", status),
            "compliance_status": status,
        })),
        MeterError::WalletNotFound(_) => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "wallet_not_found",
            "No credit wallet exists for this account",
        ),
        MeterError::InsufficientFunds { balance, cost } => {
            HttpResponse::PaymentRequired().json(serde_json::json!({
                "error": "insufficient_credits",
                "message": format!("Insufficient credits. Balance: {}, Cost: {}", balance, cost),
                "balance": balance,
                "cost": cost,
            }))
        }
        MeterError::UpstreamUnreachable(msg) => {
            tracing::warn!("Upstream unreachable: {}", msg);
            json_error(
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
                "Failed to reach upstream server",
            )
        }
        MeterError::UpstreamTimeout => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "Upstream server did not respond in time",
        ),
        MeterError::UpstreamMalformedResponse(msg) => {
            tracing::warn!("Malformed upstream response: {}", msg);
            json_error(
                StatusCode::BAD_GATEWAY,
                "upstream_malformed_response",
                "Upstream server returned an invalid response",
            )
        }
        MeterError::BillingFailure(msg)
        | MeterError::RecordingFailure(msg)
        | MeterError::Storage(msg)
        | MeterError::Internal(msg) => {
            tracing::error!("Internal error: {}", msg);
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred",
            )
        }
    }
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::Meter(e) => meter_error_response(e),
            GatewayError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg.clone()),
            GatewayError::InvalidUrl(msg) => {
                json_error(StatusCode::BAD_REQUEST, "invalid_url", msg.clone())
            }
            GatewayError::InvalidPrice(msg) => {
                json_error(StatusCode::BAD_REQUEST, "invalid_price", msg.clone())
            }
            GatewayError::BadRequest(msg) => {
                json_error(StatusCode::BAD_REQUEST, "bad_request", msg.clone())
            }
            GatewayError::UserNotFound(id) => json_error(
                StatusCode::NOT_FOUND,
                "user_not_found",
                format!("User '{}' not found", id),
            ),
            GatewayError::KeyNotFound(id) => json_error(
                StatusCode::NOT_FOUND,
                "key_not_found",
                format!("API key '{}' not found", id),
            ),
            GatewayError::PayloadTooLarge(max) => json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                format!("Request body exceeds {} bytes", max),
            ),
            GatewayError::Internal(msg) | GatewayError::Database(msg) => {
                tracing::error!("Internal error: {}", msg);
                json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred",
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_meter::ComplianceStatus;

    fn status(e: GatewayError) -> u16 {
        e.error_response().status().as_u16()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status(MeterError::Unauthenticated.into()), 401);
        assert_eq!(status(MeterError::InvalidCredential.into()), 401);
        assert_eq!(status(MeterError::Forbidden.into()), 403);
        assert_eq!(
            status(MeterError::ServerNotCompliant(ComplianceStatus::Failed).into()),
            403
        );
        assert_eq!(status(MeterError::ServerNotFound("x".into()).into()), 404);
        assert_eq!(
            status(MeterError::InsufficientFunds { balance: 1, cost: 2 }.into()),
            402
        );
        assert_eq!(status(MeterError::UpstreamUnreachable("x".into()).into()), 502);
        assert_eq!(status(MeterError::UpstreamTimeout.into()), 504);
        assert_eq!(status(MeterError::Storage("x".into()).into()), 500);
        assert_eq!(status(GatewayError::Conflict("x".into())), 409);
        assert_eq!(status(GatewayError::Database("x".into())), 500);
        assert_eq!(status(GatewayError::PayloadTooLarge(10)), 413);
        assert_eq!(status(GatewayError::UserNotFound("u".into())), 404);
    }

    #[actix_rt::test]
    async fn test_insufficient_funds_discloses_balance_and_cost() {
        let resp =
            GatewayError::from(MeterError::InsufficientFunds { balance: 4, cost: 5 }).error_response();
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "insufficient_credits");
        assert_eq!(json["balance"], 4);
        assert_eq!(json["cost"], 5);
    }

    #[test]
    fn test_internal_details_are_not_exposed() {
        let resp = GatewayError::Database("table users is locked".into()).error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
