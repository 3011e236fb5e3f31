pub mod account;
pub mod admin;
pub mod health;
pub mod proxy;
pub mod servers;

use actix_web::web;

/// Mount every route on an app or scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(health::configure)
        .configure(account::configure)
        .configure(servers::configure)
        .configure(admin::configure)
        .configure(proxy::configure);
}

/// JSON extractor config whose parse errors use the gateway's error body.
pub fn json_config(limit: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(limit)
        .error_handler(|err, _req| {
            crate::error::GatewayError::BadRequest(err.to_string()).into()
        })
}
