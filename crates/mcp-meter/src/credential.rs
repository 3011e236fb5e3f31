//! API key digesting and bearer parsing.
//!
//! Keys are never stored. The gateway keeps `HMAC-SHA256(pepper, key)` as a
//! hex digest, looks rows up by that digest, and re-checks the match with a
//! constant-time comparison from `subtle`. The pepper lives only in process
//! configuration, so a leaked database alone cannot be used to test guesses.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::MeterError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every key issued by the gateway.
pub const API_KEY_PREFIX: &str = "mcpk_";

/// Keyed digest for API keys.
#[derive(Clone)]
pub struct CredentialHasher {
    keyed: HmacSha256,
}

impl fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHasher")
            .field("pepper", &"[REDACTED]")
            .finish()
    }
}

impl CredentialHasher {
    pub fn new(pepper: &[u8]) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            keyed: HmacSha256::new_from_slice(pepper)?,
        })
    }

    /// Hex-encoded digest of a raw API key.
    pub fn digest(&self, raw_key: &str) -> String {
        let mut mac = self.keyed.clone();
        mac.update(raw_key.as_bytes());
        hex_encode(mac.finalize().into_bytes())
    }

    /// Check a raw key against a stored digest in constant time.
    pub fn verify(&self, raw_key: &str, stored_digest: &str) -> bool {
        let computed = self.digest(raw_key);
        computed.as_bytes().ct_eq(stored_digest.as_bytes()).into()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, MeterError> {
    let token = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(MeterError::Unauthenticated)?;
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(MeterError::Unauthenticated);
    }
    Ok(token)
}

/// Generate a fresh API key. Shown to the caller once and never persisted.
pub fn generate_api_key() -> String {
    format!(
        "{}{}{}",
        API_KEY_PREFIX,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    bytes.as_ref().iter().fold(String::new(), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}
