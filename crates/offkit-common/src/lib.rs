//! # Offkit Common
//!
//! Shared fetch model and logging configuration for the offkit offline
//! worker runtime.
//!
//! ## Features
//!
//! - **Fetch model**: `FetchRequest`, `NetworkResponse`, `RequestMode`
//! - **Logging**: `init_logging()` with env-filter support
//!
//! ## Architecture
//!
//! ```text
//! FetchRequest (method + URL + mode)
//!     │
//!     ├── offkit-net    ── NetworkAgent::fetch ──→ NetworkResponse
//!     ├── offkit-cache  ── RequestKey derivation
//!     └── offkit-sw     ── fetch-intercept dispatch
//! ```

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

// ==================== Request Mode ====================

/// How a request was initiated, mirroring the fetch `mode` attribute.
///
/// Only `Navigate` carries semantic weight in offkit: it selects the
/// offline-fallback policy when the network is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Same-origin subresource.
    SameOrigin,
    /// Cross-origin subresource.
    #[default]
    Cors,
    /// Opaque cross-origin subresource.
    NoCors,
}

// ==================== Fetch Request ====================

/// A request as seen by the worker: identity plus dispatch mode.
///
/// Bodies are not modeled; the offline cache only ever deals with GET.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Absolute request URL.
    pub url: Url,

    /// Request method (uppercase).
    pub method: String,

    /// Request headers.
    pub headers: HashMap<String, String>,

    /// Request mode.
    pub mode: RequestMode,
}

impl FetchRequest {
    /// Create a GET subresource request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
            mode: RequestMode::Cors,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigation(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether this request is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

// ==================== Network Response ====================

/// A response as delivered by the network collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// HTTP status code.
    pub status: u16,

    /// Status reason phrase.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,
}

impl NetworkResponse {
    /// Create a 200 response with the given body.
    pub fn ok_with_body(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body,
        }
    }

    /// Create a response with the given status and empty body.
    pub fn with_status(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Check if the status is a success (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    /// Get the body as UTF-8 text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_get_request_defaults() {
        let req = FetchRequest::get(url("https://app.example/index.html"));
        assert_eq!(req.method, "GET");
        assert_eq!(req.mode, RequestMode::Cors);
        assert!(!req.is_navigation());
    }

    #[test]
    fn test_navigation_request() {
        let req = FetchRequest::navigation(url("https://app.example/"));
        assert!(req.is_navigation());
    }

    #[test]
    fn test_request_header_builder() {
        let req = FetchRequest::get(url("https://app.example/api"))
            .header("accept", "application/json");
        assert_eq!(req.headers.get("accept").map(String::as_str), Some("application/json"));
    }

    #[test]
    fn test_response_success() {
        assert!(NetworkResponse::ok_with_body(b"hi".to_vec()).is_success());
        assert!(!NetworkResponse::with_status(404, "Not Found").is_success());
    }

    #[test]
    fn test_response_text() {
        let resp = NetworkResponse::ok_with_body(b"<html>".to_vec());
        assert_eq!(resp.text().unwrap(), "<html>");
    }

    #[test]
    fn test_request_serde_round_trip() {
        let req = FetchRequest::navigation(url("https://app.example/inbox"));
        let json = serde_json::to_string(&req).unwrap();
        let back: FetchRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.url, req.url);
        assert_eq!(back.mode, RequestMode::Navigate);
    }
}
