use bytes::Bytes;
use mcp_meter::{DispatchFailure, Dispatcher, UpstreamResponse, UpstreamServer};

use crate::validation::ensure_public_host;

/// Correlation header attached to outbound calls and to every proxy response.
pub const REQUEST_ID_HEADER: &str = "X-Gateway-Request-ID";

/// Allowlist of response headers to forward from the upstream.
/// Prevents leaking internal upstream headers (e.g. Server, X-Powered-By).
const ALLOWED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "vary",
    "mcp-session-id",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    // access-control-* is excluded: the gateway's CORS middleware owns those.
];

/// Maximum upstream response body size (10 MB).
pub const MAX_RESPONSE_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Forwards caller bodies to upstream servers over HTTP.
///
/// Only the body is forwarded; caller headers (including `Authorization`) are
/// never copied to the upstream.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    allow_private: bool,
}

impl HttpDispatcher {
    pub fn new(client: reqwest::Client, allow_private: bool) -> Self {
        Self {
            client,
            allow_private,
        }
    }
}

fn classify(e: &reqwest::Error) -> DispatchFailure {
    if e.is_timeout() {
        DispatchFailure::Timeout
    } else {
        DispatchFailure::Unreachable(e.to_string())
    }
}

impl Dispatcher for HttpDispatcher {
    async fn forward(
        &self,
        server: &UpstreamServer,
        body: Bytes,
        request_id: &str,
    ) -> Result<UpstreamResponse, DispatchFailure> {
        let url = url::Url::parse(&server.url)
            .map_err(|e| DispatchFailure::Unreachable(format!("invalid upstream URL: {e}")))?;

        if !self.allow_private {
            ensure_public_host(&url)
                .await
                .map_err(DispatchFailure::Unreachable)?;
        }

        let mut response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, request_id)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(request_id = %request_id, server_id = %server.id, error = %e, "upstream request failed");
                classify(&e)
            })?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| ALLOWED_RESPONSE_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Check Content-Length before reading (fast path)
        if let Some(cl) = response.content_length() {
            if cl > MAX_RESPONSE_BODY_SIZE as u64 {
                return Err(DispatchFailure::Malformed(format!(
                    "upstream response too large: {} bytes (max {})",
                    cl, MAX_RESPONSE_BODY_SIZE
                )));
            }
        }

        // Stream with progressive size enforcement so chunked bodies without
        // Content-Length cannot exhaust memory.
        let mut body_buf = Vec::with_capacity(
            response
                .content_length()
                .map(|cl| cl as usize)
                .unwrap_or(8192)
                .min(MAX_RESPONSE_BODY_SIZE),
        );
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            tracing::error!(request_id = %request_id, error = %e, "failed to read upstream response body");
            if e.is_timeout() {
                DispatchFailure::Timeout
            } else {
                DispatchFailure::Malformed("failed to read upstream response".to_string())
            }
        })? {
            if body_buf.len() + chunk.len() > MAX_RESPONSE_BODY_SIZE {
                return Err(DispatchFailure::Malformed(format!(
                    "upstream response too large (max {} bytes)",
                    MAX_RESPONSE_BODY_SIZE
                )));
            }
            body_buf.extend_from_slice(&chunk);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            body: Bytes::from(body_buf),
        })
    }
}
