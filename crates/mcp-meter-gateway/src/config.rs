use std::env;
use std::time::Duration;

const DEFAULT_PORT: u16 = 4080;
const DEFAULT_DB_PATH: &str = "./mcp-meter.db";
const DEFAULT_DB_POOL_SIZE: u32 = 8;
const DEFAULT_RATE_LIMIT_RPM: u32 = 120;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const MIN_PEPPER_LEN: usize = 32;
/// Only used when MCP_METER_INSECURE_DEV is set.
const DEV_PEPPER: &str = "mcp-meter-insecure-development-pepper";

#[derive(Clone)]
pub struct GatewayConfig {
    /// Server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Maximum pooled SQLite connections
    pub db_pool_size: u32,
    /// Server-side secret mixed into every API key digest
    pub credential_pepper: Vec<u8>,
    /// Upper bound on a proxied upstream call
    pub upstream_timeout: Duration,
    /// Upper bound on a compliance handshake call
    pub handshake_timeout: Duration,
    /// Maximum inbound request body size
    pub max_body_bytes: usize,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Rate limit requests per minute
    pub rate_limit_rpm: u32,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
    /// Allow http:// and private-network upstreams (development and tests only)
    pub allow_private_upstreams: bool,
    /// Email of the admin created at startup if missing
    pub bootstrap_admin_email: Option<String>,
    /// API key assigned to the bootstrap admin
    pub bootstrap_admin_key: Option<String>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("db_pool_size", &self.db_pool_size)
            .field("credential_pepper", &"[REDACTED]")
            .field("upstream_timeout", &self.upstream_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allow_private_upstreams", &self.allow_private_upstreams)
            .field("bootstrap_admin_email", &self.bootstrap_admin_email)
            .field(
                "bootstrap_admin_key",
                &self.bootstrap_admin_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let insecure_dev = env_flag("MCP_METER_INSECURE_DEV");

        // Required: credential pepper
        let credential_pepper = match env::var("CREDENTIAL_PEPPER")
            .ok()
            .filter(|s| !s.is_empty())
        {
            Some(p) => {
                if p.len() < MIN_PEPPER_LEN {
                    tracing::warn!(
                        "CREDENTIAL_PEPPER is too short ({} bytes, minimum {}); \
                         use `openssl rand -hex 32` to generate a secure pepper",
                        p.len(),
                        MIN_PEPPER_LEN
                    );
                }
                p.into_bytes()
            }
            None if insecure_dev => {
                tracing::warn!(
                    "MCP_METER_INSECURE_DEV=true: using a fixed credential pepper. \
                     DO NOT use this in production!"
                );
                DEV_PEPPER.as_bytes().to_vec()
            }
            None => {
                tracing::error!(
                    "CREDENTIAL_PEPPER is required. Set it to a secure random value \
                     (e.g. `openssl rand -hex 32`). For local development only, set \
                     MCP_METER_INSECURE_DEV=true to skip."
                );
                return Err(ConfigError::MissingRequired("CREDENTIAL_PEPPER"));
            }
        };

        let port = parse_or("PORT", DEFAULT_PORT)?;
        let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let db_pool_size: u32 = parse_or("DB_POOL_SIZE", DEFAULT_DB_POOL_SIZE)?;
        if db_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DB_POOL_SIZE",
                value: "0".to_string(),
            });
        }

        let upstream_timeout = Duration::from_secs(parse_or(
            "UPSTREAM_TIMEOUT_SECS",
            DEFAULT_UPSTREAM_TIMEOUT_SECS,
        )?);
        let handshake_timeout = Duration::from_secs(parse_or(
            "HANDSHAKE_TIMEOUT_SECS",
            DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        )?);
        let max_body_bytes = parse_or("MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["http://localhost:3000".to_string()]);

        let rate_limit_rpm = parse_or("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?;
        let metrics_token = env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty());
        let allow_private_upstreams = env_flag("ALLOW_PRIVATE_UPSTREAMS");

        let bootstrap_admin_email = env::var("BOOTSTRAP_ADMIN_EMAIL")
            .ok()
            .filter(|s| !s.is_empty());
        let bootstrap_admin_key = env::var("BOOTSTRAP_ADMIN_KEY")
            .ok()
            .filter(|s| !s.is_empty());
        if bootstrap_admin_email.is_some() != bootstrap_admin_key.is_some() {
            return Err(ConfigError::MissingRequired(
                "BOOTSTRAP_ADMIN_EMAIL and BOOTSTRAP_ADMIN_KEY must be set together",
            ));
        }

        if allowed_origins.iter().any(|o| o == "*") && !insecure_dev {
            tracing::error!(
                "Wildcard CORS origin '*' is not allowed in production. \
                 Specify explicit origins in ALLOWED_ORIGINS, or set MCP_METER_INSECURE_DEV=true."
            );
            return Err(ConfigError::InvalidValue {
                name: "ALLOWED_ORIGINS",
                value: "*".to_string(),
            });
        }

        if allow_private_upstreams {
            tracing::warn!(
                "ALLOW_PRIVATE_UPSTREAMS=true: upstreams on private networks and plain HTTP are accepted"
            );
        }

        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set: /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            port,
            db_path,
            db_pool_size,
            credential_pepper,
            upstream_timeout,
            handshake_timeout,
            max_body_bytes,
            allowed_origins,
            rate_limit_rpm,
            metrics_token,
            allow_private_upstreams,
            bootstrap_admin_email,
            bootstrap_admin_key,
        })
    }

    /// Configuration for tests and embedding: in-memory defaults, private
    /// upstreams allowed.
    pub fn for_testing(db_path: &str) -> Self {
        Self {
            port: 0,
            db_path: db_path.to_string(),
            db_pool_size: 4,
            credential_pepper: DEV_PEPPER.as_bytes().to_vec(),
            upstream_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allowed_origins: vec!["*".to_string()],
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            metrics_token: None,
            allow_private_upstreams: true,
            bootstrap_admin_email: None,
            bootstrap_admin_key: None,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        _ => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = GatewayConfig::for_testing(":memory:");
        config.metrics_token = Some("metrics-secret".to_string());
        config.bootstrap_admin_key = Some("mcpk_secret".to_string());
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("metrics-secret"));
        assert!(!rendered.contains("mcpk_secret"));
        assert!(!rendered.contains(DEV_PEPPER));
    }

    #[test]
    fn test_parse_or_default_and_invalid() {
        // Names chosen so they cannot collide with a real environment.
        assert_eq!(parse_or("MCP_METER_TEST_UNSET_PORT", 7u16).unwrap(), 7);
        env::set_var("MCP_METER_TEST_BAD_PORT", "not-a-number");
        assert!(matches!(
            parse_or::<u16>("MCP_METER_TEST_BAD_PORT", 7),
            Err(ConfigError::InvalidValue { .. })
        ));
        env::set_var("MCP_METER_TEST_GOOD_PORT", " 9000 ");
        assert_eq!(parse_or("MCP_METER_TEST_GOOD_PORT", 7u16).unwrap(), 9000);
    }
}
