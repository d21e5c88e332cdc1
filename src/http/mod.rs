//! HTTP transport collaborator interface
//!
//! The core never ships a concrete transport. It talks to one through
//! [`HttpClient`]; implementations live outside the crate (or in tests,
//! where a scripted fake stands in for the network).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CrawlError;
use crate::proxy::ProxyInfo;
use crate::request::{Headers, Request};
use crate::session::Session;

/// A received HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub http_version: String,
    /// Final URL after redirects.
    pub loaded_url: String,
}

impl HttpResponse {
    /// Response body bytes.
    #[must_use]
    pub fn read(&self) -> &[u8] {
        &self.body
    }

    /// Parsed `Retry-After` header (seconds form only).
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Abstract HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send the request through the given proxy using the given session's
    /// cookies. Transport-level failures map to [`CrawlError::Transport`];
    /// received responses are returned as-is regardless of status.
    async fn send(
        &self,
        request: &Request,
        session: Option<&Arc<Session>>,
        proxy: Option<&ProxyInfo>,
    ) -> Result<HttpResponse, CrawlError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = Headers::new();
        headers.insert("Retry-After", "7");
        let response = HttpResponse {
            status_code: 429,
            headers,
            body: Vec::new(),
            http_version: "HTTP/1.1".to_string(),
            loaded_url: "http://example.com".to_string(),
        };
        assert_eq!(response.retry_after(), Some(Duration::from_secs(7)));
        assert!(!response.is_success());
    }

    #[test]
    fn missing_retry_after_is_none() {
        let response = HttpResponse {
            status_code: 200,
            headers: Headers::new(),
            body: b"ok".to_vec(),
            http_version: "HTTP/2".to_string(),
            loaded_url: "http://example.com".to_string(),
        };
        assert_eq!(response.retry_after(), None);
        assert_eq!(response.read(), b"ok");
    }
}
