use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use mcp_meter::{BillingOutcome, DispatchFailure, InboundCall, MeterError, Settlement};

use crate::auth::authorization_header;
use crate::dispatch::REQUEST_ID_HEADER;
use crate::error::GatewayError;
use crate::metrics::{
    ADMISSIONS_REJECTED, BILLING_FAILURES, CREDITS_DEBITED, DISPATCHES_TOTAL, DISPATCH_LATENCY,
    PROXY_REQUESTS_TOTAL, RECORDING_FAILURES, UPSTREAM_FAILURES,
};
use crate::state::AppState;

/// POST /mcp/{server_id} - Metered proxy to a registered MCP server
pub async fn proxy(
    req: HttpRequest,
    path: web::Path<String>,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> HttpResponse {
    let request_id = uuid::Uuid::new_v4().to_string();
    let server_id = path.into_inner();

    let mut response = match run(&req, server_id, payload, &state, &request_id).await {
        Ok(resp) => resp,
        Err(e) => e.error_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-gateway-request-id"), value);
    }
    response
}

async fn run(
    req: &HttpRequest,
    server_id: String,
    payload: web::Payload,
    state: &AppState,
    request_id: &str,
) -> Result<HttpResponse, GatewayError> {
    // Credentials are checked before the body is read, so an unauthenticated
    // caller always gets 401 regardless of payload size.
    let authorization = authorization_header(req);
    let principal = state
        .gateway
        .authenticate(authorization.as_deref())
        .await
        .map_err(rejected)?;

    let limit = state.config.max_body_bytes;
    let body = match payload.to_bytes_limited(limit).await {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            return Err(MeterError::MalformedRequest(format!("failed to read body: {e}")).into())
        }
        Err(_) => {
            ADMISSIONS_REJECTED
                .with_label_values(&["payload_too_large"])
                .inc();
            PROXY_REQUESTS_TOTAL.with_label_values(&["rejected"]).inc();
            return Err(GatewayError::PayloadTooLarge(limit));
        }
    };

    let call = InboundCall {
        authorization,
        server_id,
        body,
        request_id: request_id.to_string(),
    };

    let settlement = state
        .gateway
        .handle_authenticated(principal, call)
        .await
        .map_err(rejected)?;
    Ok(relay(settlement))
}

fn rejected(e: MeterError) -> GatewayError {
    ADMISSIONS_REJECTED.with_label_values(&[e.kind()]).inc();
    PROXY_REQUESTS_TOTAL.with_label_values(&["rejected"]).inc();
    e.into()
}

fn observe(settlement: &Settlement) {
    let usage = &settlement.usage;
    DISPATCHES_TOTAL
        .with_label_values(&[usage.server_id.as_str()])
        .inc();
    DISPATCH_LATENCY.observe(settlement.dispatch_latency.as_secs_f64());

    match usage.billing {
        BillingOutcome::Charged => CREDITS_DEBITED
            .with_label_values(&[usage.server_id.as_str()])
            .inc_by(u64::try_from(usage.cost).unwrap_or(0)),
        BillingOutcome::Failed => BILLING_FAILURES.inc(),
        BillingOutcome::NotCharged => {}
    }
    if !settlement.recorded {
        RECORDING_FAILURES.inc();
    }

    let failure_kind = match &settlement.dispatch {
        Ok(resp) if resp.is_success() => None,
        Ok(_) => Some("status"),
        Err(DispatchFailure::Unreachable(_)) => Some("unreachable"),
        Err(DispatchFailure::Timeout) => Some("timeout"),
        Err(DispatchFailure::Malformed(_)) => Some("malformed"),
    };
    match failure_kind {
        None => PROXY_REQUESTS_TOTAL.with_label_values(&["relayed"]).inc(),
        Some(kind) => {
            UPSTREAM_FAILURES.with_label_values(&[kind]).inc();
            PROXY_REQUESTS_TOTAL
                .with_label_values(&["upstream_failed"])
                .inc();
        }
    }
}

/// Turn a settlement into the caller's response: the upstream reply as-is,
/// or a gateway error when no reply was obtained.
fn relay(settlement: Settlement) -> HttpResponse {
    observe(&settlement);

    match settlement.dispatch {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = HttpResponse::build(status);
            for (name, value) in &upstream.headers {
                if name.eq_ignore_ascii_case(REQUEST_ID_HEADER) {
                    continue;
                }
                builder.insert_header((name.as_str(), value.as_str()));
            }
            builder.body(upstream.body)
        }
        Err(failure) => GatewayError::from(MeterError::from(failure)).error_response(),
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/mcp/{server_id}", web::post().to(proxy));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mcp_meter::{Stage, UpstreamResponse, UsageEvent};
    use std::time::Duration;

    fn settlement(dispatch: Result<UpstreamResponse, DispatchFailure>) -> Settlement {
        let is_success = dispatch.as_ref().map(|r| r.is_success()).unwrap_or(false);
        Settlement {
            usage: UsageEvent {
                user_id: "u".into(),
                server_id: "s".into(),
                api_key_id: "k".into(),
                cost: 3,
                is_success,
                billing: if is_success {
                    BillingOutcome::Charged
                } else {
                    BillingOutcome::NotCharged
                },
                gateway_request_id: "r".into(),
                upstream_status: dispatch.as_ref().ok().map(|r| r.status),
                timestamp: Utc::now(),
            },
            dispatch,
            recorded: true,
            dispatch_latency: Duration::from_millis(5),
            stage: Stage::Logged,
        }
    }

    #[test]
    fn test_relay_preserves_upstream_status_and_headers() {
        let resp = relay(settlement(Ok(UpstreamResponse {
            status: 404,
            headers: vec![("content-type".into(), "application/json".into())],
            body: bytes::Bytes::from_static(b"{}"),
        })));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn test_relay_maps_transport_failures() {
        assert_eq!(
            relay(settlement(Err(DispatchFailure::Timeout))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            relay(settlement(Err(DispatchFailure::Unreachable("refused".into())))).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            relay(settlement(Err(DispatchFailure::Malformed("too big".into())))).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
