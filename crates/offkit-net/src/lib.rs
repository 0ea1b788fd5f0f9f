//! # Offkit Net
//!
//! Network collaborator boundary for the offkit offline worker runtime.
//!
//! The worker treats the network as an opaque request/response exchange:
//! manifest resources are fetched through it at install time, and cache
//! misses fall through to it at fetch-intercept time. Timeouts, redirects,
//! and TLS all live behind the [`NetworkAgent`] seam.
//!
//! ## Agents
//!
//! - [`HttpAgent`]: reqwest-backed agent for real deployments
//! - [`StaticAgent`]: canned routes plus an offline switch, for bring-up
//!   and tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use offkit_common::{FetchRequest, NetworkResponse};

// ==================== Errors ====================

/// Errors produced by the network boundary.
#[derive(Error, Debug)]
pub enum NetError {
    /// The network is unavailable or the host could not be reached.
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

// ==================== Network Agent ====================

/// Opaque network collaborator: request in, response or failure out.
///
/// Implementations decide their own timeout and redirect policy; the worker
/// never retries on its own.
#[async_trait]
pub trait NetworkAgent: Send + Sync {
    /// Perform the exchange for a single request.
    async fn fetch(&self, request: &FetchRequest) -> Result<NetworkResponse, NetError>;
}

// ==================== HTTP Agent ====================

/// Configuration for [`HttpAgent`].
#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
}

impl Default for HttpAgentConfig {
    fn default() -> Self {
        Self {
            user_agent: "Offkit/1.0".to_string(),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed network agent.
pub struct HttpAgent {
    client: reqwest::Client,
}

impl HttpAgent {
    /// Create an agent with default configuration.
    pub fn new() -> Result<Self, NetError> {
        Self::with_config(HttpAgentConfig::default())
    }

    /// Create an agent with custom configuration.
    pub fn with_config(config: HttpAgentConfig) -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkAgent for HttpAgent {
    async fn fetch(&self, request: &FetchRequest) -> Result<NetworkResponse, NetError> {
        debug!(url = %request.url, method = %request.method, "fetching resource");

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                NetError::Unreachable(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(NetworkResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

// ==================== Static Agent ====================

/// Agent serving canned responses from a route table.
///
/// Unrouted URLs get a 404; flipping the offline switch makes every fetch
/// fail with [`NetError::Unreachable`], which is how tests simulate a dead
/// network.
#[derive(Default)]
pub struct StaticAgent {
    routes: RwLock<HashMap<String, NetworkResponse>>,
    offline: AtomicBool,
}

impl StaticAgent {
    /// Create an empty agent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned response for a URL.
    pub async fn route(&self, url: &Url, response: NetworkResponse) {
        self.routes
            .write()
            .await
            .insert(url.as_str().to_string(), response);
    }

    /// Register a 200 text response for a URL.
    pub async fn route_ok(&self, url: &Url, body: &str) {
        self.route(url, NetworkResponse::ok_with_body(body.as_bytes().to_vec()))
            .await;
    }

    /// Remove a route.
    pub async fn unroute(&self, url: &Url) {
        self.routes.write().await.remove(url.as_str());
    }

    /// Simulate the network going down or coming back up.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkAgent for StaticAgent {
    async fn fetch(&self, request: &FetchRequest) -> Result<NetworkResponse, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            warn!(url = %request.url, "static agent offline, refusing fetch");
            return Err(NetError::Unreachable("agent is offline".to_string()));
        }

        match self.routes.read().await.get(request.url.as_str()) {
            Some(response) => Ok(response.clone()),
            None => Ok(NetworkResponse::with_status(404, "Not Found")),
        }
    }
}
