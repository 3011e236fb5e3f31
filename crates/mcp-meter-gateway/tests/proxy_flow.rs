use actix_web::{test, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Value};

use mcp_meter::{generate_api_key, BillingOutcome, ComplianceStatus};
use mcp_meter_gateway::{routes, AppState, Database, GatewayConfig};

/// Minimal MCP server: answers `initialize` and echoes everything else.
async fn echo_upstream(req: HttpRequest, body: web::Json<Value>) -> HttpResponse {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    if method == "initialize" {
        return HttpResponse::Ok().json(json!({"name": "echo-mcp", "version": "1.0.0"}));
    }
    if body["params"]["name"] == "explode" {
        return HttpResponse::InternalServerError().json(json!({"error": "boom"}));
    }
    HttpResponse::Ok()
        .insert_header(("x-powered-by", "upstream-framework"))
        .json(json!({
            "result": "ok",
            "method": method,
            "saw_authorization": req.headers().contains_key("authorization"),
            "request_id": req
                .headers()
                .get("x-gateway-request-id")
                .and_then(|v| v.to_str().ok()),
        }))
}

/// Replies 200 to everything but without the fields a handshake needs.
async fn broken_upstream() -> HttpResponse {
    HttpResponse::Ok().json(json!({"hello": "world"}))
}

/// Start the fake upstream on an ephemeral port and return its base URL.
fn start_upstream() -> String {
    let server = HttpServer::new(|| {
        App::new()
            .route("/mcp", web::post().to(echo_upstream))
            .route("/broken", web::post().to(broken_upstream))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let port = server.addrs()[0].port();
    actix_rt::spawn(server.run());
    format!("http://127.0.0.1:{port}")
}

struct Harness {
    state: web::Data<AppState>,
    upstream: String,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.db");
        let config = GatewayConfig::for_testing(path.to_str().unwrap());
        let db = Database::new(&config.db_path, config.db_pool_size).unwrap();
        let state = AppState::new(config, db).unwrap();
        Self {
            state: web::Data::new(state),
            upstream: start_upstream(),
            _dir: dir,
        }
    }

    /// Create a user directly in storage; returns (user_id, raw API key).
    fn user(&self, email: &str, is_admin: bool, credits: i64) -> (String, String) {
        let key = generate_api_key();
        let digest = self.state.hasher.digest(&key);
        let (user, _) = self
            .state
            .db
            .create_user(email, is_admin, credits, &digest)
            .unwrap();
        (user.id, key)
    }

    fn balance(&self, user_id: &str) -> Option<i64> {
        self.state.db.balance(user_id).unwrap()
    }
}

macro_rules! gateway_app {
    ($harness:expr) => {
        test::init_service(
            App::new()
                .app_data($harness.state.clone())
                .app_data(routes::json_config(65_536))
                .configure(routes::configure),
        )
        .await
    };
}

fn bearer(key: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {key}"))
}

fn request_id<B>(resp: &actix_web::dev::ServiceResponse<B>) -> Option<String> {
    resp.headers()
        .get("x-gateway-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Register a server priced at base 3 / search 5 and return its id.
macro_rules! register {
    ($app:expr, $key:expr, $url:expr) => {{
        let req = test::TestRequest::post()
            .uri("/servers")
            .insert_header(bearer($key))
            .set_json(json!({
                "name": "echo",
                "url": $url,
                "base_price": 3,
                "tool_prices": [{"tool_name": "search", "price_in_credits": 5}],
            }))
            .to_request();
        let body: Value = test::call_and_read_body_json($app, req).await;
        assert_eq!(body["server"]["compliance_status"], "UNVERIFIED");
        body["server"]["id"].as_str().unwrap().to_string()
    }};
}

fn tool_call(tool: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": tool}})
}

#[actix_rt::test]
async fn test_full_metered_flow() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (_, admin_key) = h.user("admin@example.com", true, 0);
    let (user_id, user_key) = h.user("dev@example.com", false, 10);

    let server_id = register!(&app, &user_key, &format!("{}/mcp", h.upstream));

    // Unverified servers receive no traffic.
    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&user_key))
        .set_json(tool_call("search"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    assert!(request_id(&resp).is_some());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["compliance_status"], "UNVERIFIED");

    // Admin runs the handshake.
    let req = test::TestRequest::post()
        .uri(&format!("/admin/servers/{server_id}/validate"))
        .insert_header(bearer(&admin_key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["new_status"], "PASSED");
    assert_eq!(body["server_id"], server_id.as_str());

    // Priced tool call: 5 credits.
    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&user_key))
        .set_json(tool_call("search"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let rid = request_id(&resp).unwrap();
    assert!(resp.headers().get("x-powered-by").is_none());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"], "ok");
    assert_eq!(body["saw_authorization"], false);
    assert_eq!(body["request_id"], rid.as_str());
    assert_eq!(h.balance(&user_id), Some(5));

    let events = h.state.db.usage_by_request_id(&rid).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cost, 5);
    assert!(events[0].is_success);
    assert_eq!(events[0].billing, BillingOutcome::Charged);
    assert_eq!(events[0].upstream_status, Some(200));

    // Untariffed method falls back to the base price: 3 credits.
    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&user_key))
        .set_json(json!({"method": "tools/list"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(h.balance(&user_id), Some(2));

    // Usage listing, newest first.
    let req = test::TestRequest::get()
        .uri("/usage?limit=10")
        .insert_header(bearer(&user_key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["cost"], 3);
    assert_eq!(events[1]["gateway_request_id"], rid.as_str());
}

#[actix_rt::test]
async fn test_insufficient_balance_blocks_dispatch() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("poor@example.com", false, 2);
    let server_id = register!(&app, &key, &format!("{}/mcp", h.upstream));
    h.state
        .db
        .set_compliance_status(&server_id, ComplianceStatus::Passed)
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&key))
        .set_json(tool_call("search"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let rid = request_id(&resp).unwrap();
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "insufficient_credits");
    assert_eq!(body["balance"], 2);
    assert_eq!(body["cost"], 5);

    assert_eq!(h.balance(&user_id), Some(2));
    assert!(h.state.db.usage_by_request_id(&rid).unwrap().is_empty());
}

#[actix_rt::test]
async fn test_upstream_error_is_relayed_and_not_charged() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("dev@example.com", false, 10);
    let server_id = register!(&app, &key, &format!("{}/mcp", h.upstream));
    h.state
        .db
        .set_compliance_status(&server_id, ComplianceStatus::Passed)
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&key))
        .set_json(tool_call("explode"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 500);
    let rid = request_id(&resp).unwrap();

    assert_eq!(h.balance(&user_id), Some(10));
    let events = h.state.db.usage_by_request_id(&rid).unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_success);
    assert_eq!(events[0].billing, BillingOutcome::NotCharged);
    assert_eq!(events[0].upstream_status, Some(500));
}

#[actix_rt::test]
async fn test_unreachable_upstream_is_recorded_without_status() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("dev@example.com", false, 10);

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let server_id = register!(&app, &key, &format!("http://127.0.0.1:{port}/mcp"));
    h.state
        .db
        .set_compliance_status(&server_id, ComplianceStatus::Passed)
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&key))
        .set_json(tool_call("search"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 502);
    let rid = request_id(&resp).unwrap();

    assert_eq!(h.balance(&user_id), Some(10));
    let events = h.state.db.usage_by_request_id(&rid).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].upstream_status, None);
}

#[actix_rt::test]
async fn test_credentials_are_checked() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("dev@example.com", false, 10);

    let req = test::TestRequest::get().uri("/whoami").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/whoami")
        .insert_header(bearer(&key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["user"]["id"], user_id.as_str());

    // Unknown and revoked keys produce identical responses.
    let req = test::TestRequest::get()
        .uri("/whoami")
        .insert_header(bearer(&generate_api_key()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let unknown: Value = test::read_body_json(resp).await;

    let record = h
        .state
        .db
        .key_by_digest(&h.state.hasher.digest(&key))
        .unwrap()
        .unwrap();
    h.state.db.revoke_key(&record.key_id).unwrap();

    let req = test::TestRequest::get()
        .uri("/whoami")
        .insert_header(bearer(&key))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let revoked: Value = test::read_body_json(resp).await;
    assert_eq!(unknown, revoked);
}

#[actix_rt::test]
async fn test_proxy_without_credentials_still_gets_request_id() {
    let h = Harness::new();
    let app = gateway_app!(h);

    let req = test::TestRequest::post()
        .uri("/mcp/does-not-matter")
        .set_json(tool_call("search"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    assert!(request_id(&resp).is_some());
}

#[actix_rt::test]
async fn test_oversized_body_without_credentials_is_unauthorized() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let oversized = vec![b' '; h.state.config.max_body_bytes + 1];

    let req = test::TestRequest::post()
        .uri("/mcp/x")
        .insert_header(("content-type", "application/json"))
        .set_payload(oversized.clone())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    assert!(request_id(&resp).is_some());

    // Authenticated callers hit the body limit instead.
    let (_, key) = h.user("big@example.com", false, 10);
    let req = test::TestRequest::post()
        .uri("/mcp/x")
        .insert_header(bearer(&key))
        .insert_header(("content-type", "application/json"))
        .set_payload(oversized)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 413);
}

#[actix_rt::test]
async fn test_failed_handshake_marks_server_failed() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (_, admin_key) = h.user("admin@example.com", true, 0);
    let server_id = register!(&app, &admin_key, &format!("{}/broken", h.upstream));

    let req = test::TestRequest::post()
        .uri(&format!("/admin/servers/{server_id}/validate"))
        .insert_header(bearer(&admin_key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["new_status"], "FAILED");
    assert_eq!(
        h.state.db.compliance_status(&server_id).unwrap(),
        Some(ComplianceStatus::Failed)
    );

    let req = test::TestRequest::post()
        .uri("/admin/servers/missing/validate")
        .insert_header(bearer(&admin_key))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn test_admin_routes_require_admin() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("dev@example.com", false, 0);

    let req = test::TestRequest::post()
        .uri("/admin/credits")
        .insert_header(bearer(&key))
        .set_json(json!({"user_id": user_id, "amount": 100}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
    assert_eq!(h.balance(&user_id), Some(0));
}

#[actix_rt::test]
async fn test_admin_user_lifecycle_and_credits() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (_, admin_key) = h.user("admin@example.com", true, 0);

    let req = test::TestRequest::post()
        .uri("/admin/users")
        .insert_header(bearer(&admin_key))
        .set_json(json!({"email": "new@example.com", "initial_credits": 7}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let body: Value = test::read_body_json(resp).await;
    let new_id = body["user"]["id"].as_str().unwrap().to_string();
    let new_key = body["api_key"].as_str().unwrap().to_string();
    assert!(new_key.starts_with("mcpk_"));

    // Duplicate email conflicts.
    let req = test::TestRequest::post()
        .uri("/admin/users")
        .insert_header(bearer(&admin_key))
        .set_json(json!({"email": "new@example.com"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    // Top up.
    let req = test::TestRequest::post()
        .uri("/admin/credits")
        .insert_header(bearer(&admin_key))
        .set_json(json!({"user_id": new_id, "amount": 5}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["balance"], 12);

    let cases: [(&str, i64, u16); 3] = [
        (new_id.as_str(), 0, 400),
        (new_id.as_str(), -3, 400),
        ("missing-user", 5, 404),
    ];
    for (user, amount, expected) in cases {
        let req = test::TestRequest::post()
            .uri("/admin/credits")
            .insert_header(bearer(&admin_key))
            .set_json(json!({"user_id": user, "amount": amount}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), expected);
    }

    // The issued key works and reports the topped-up wallet.
    let req = test::TestRequest::get()
        .uri("/wallet")
        .insert_header(bearer(&new_key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["balance"], 12);

    // A second key, then revoke it.
    let req = test::TestRequest::post()
        .uri(&format!("/admin/users/{new_id}/keys"))
        .insert_header(bearer(&admin_key))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let second_key = body["api_key"].as_str().unwrap().to_string();
    let second_id = body["api_key_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/admin/keys/{second_id}/revoke"))
        .insert_header(bearer(&admin_key))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    let req = test::TestRequest::get()
        .uri("/whoami")
        .insert_header(bearer(&second_key))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);
}

#[actix_rt::test]
async fn test_registration_validation() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (_, key) = h.user("dev@example.com", false, 0);

    let cases = [
        json!({"url": "not a url"}),
        json!({"url": "ftp://example.com"}),
        json!({"url": "https://mcp.example.com", "base_price": -1}),
        json!({"url": "https://mcp.example.com",
               "tool_prices": [{"tool_name": "a", "price_in_credits": 1},
                               {"tool_name": "a", "price_in_credits": 2}]}),
        json!({"name": "missing url"}),
    ];
    for case in cases {
        let req = test::TestRequest::post()
            .uri("/servers")
            .insert_header(bearer(&key))
            .set_json(case)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);
    }

    let req = test::TestRequest::get()
        .uri("/servers/nope")
        .insert_header(bearer(&key))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_rt::test]
async fn test_malformed_proxy_body_is_rejected() {
    let h = Harness::new();
    let app = gateway_app!(h);
    let (user_id, key) = h.user("dev@example.com", false, 10);
    let server_id = register!(&app, &key, &format!("{}/mcp", h.upstream));
    h.state
        .db
        .set_compliance_status(&server_id, ComplianceStatus::Passed)
        .unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/mcp/{server_id}"))
        .insert_header(bearer(&key))
        .insert_header(("Content-Type", "application/json"))
        .set_payload("not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(h.balance(&user_id), Some(10));
}

#[actix_rt::test]
async fn test_health() {
    let h = Harness::new();
    let app = gateway_app!(h);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");
}
