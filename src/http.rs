//! HTTP collaborator seam.
//!
//! The engine never owns an HTTP client; the embedding platform
//! provides one behind [`HttpTransport`]. Requests carry JSON bodies,
//! responses come back whole (the collaborator is responsible for
//! per-request timeouts). DNS resolution rides on the same seam since
//! the platform may need to resolve through a protected socket.

use crate::status::Status;
use async_trait::async_trait;
use std::collections::HashMap;

/// HTTP status line of a completed request.
#[derive(Clone, Debug)]
pub struct HttpStatus {
    pub code: u16,
    pub message: String,
}

/// An outgoing JSON POST request.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub json_body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            json_body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach the backend API key header when one is configured.
    pub fn with_api_key(self, api_key: Option<&str>) -> Self {
        match api_key {
            Some(key) => self.with_header("X-Api-Key", key),
            None => self,
        }
    }
}

/// A completed HTTP exchange.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: HttpStatus,
    pub json_body: Option<String>,
}

impl HttpResponse {
    /// Whether the response carries a 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status.code)
    }

    /// Convert a non-2xx response into a [`Status`], prefixed with
    /// context about which request failed.
    pub(crate) fn to_status(&self, context: &str) -> Status {
        Status::from_http(
            self.status.code,
            format!(
                "{} failed with code {}: {}",
                context, self.status.code, self.status.message
            ),
        )
    }

    /// Parse the JSON body, mapping absence or malformation to
    /// `InvalidArgument`.
    pub(crate) fn parse_json(&self) -> Result<serde_json::Value, Status> {
        let body = self
            .json_body
            .as_deref()
            .ok_or_else(|| Status::invalid_argument("response has no JSON body"))?;
        serde_json::from_str(body)
            .map_err(|e| Status::invalid_argument(format!("malformed JSON body: {}", e)))
    }
}

/// The HTTP transport the platform provides.
///
/// `post_json` is infallible at the transport level by convention:
/// network-level failures are reported as a synthesized 5xx response so
/// every path funnels through the same HTTP status classification.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, request: HttpRequest) -> HttpResponse;

    /// Resolve a hostname to a single IP address string.
    async fn lookup_dns(&self, hostname: &str) -> Result<String, Status>;
}
