//! # Offkit SW
//!
//! Offline worker lifecycle controller for the offkit runtime.
//!
//! ## Features
//!
//! - **Lifecycle**: install → activate → fetch-intercept state machine
//! - **Precache**: manifest-driven, all-or-nothing install
//! - **Cache-first fetch**: stored entries served verbatim, no revalidation
//! - **Offline fallback**: designated page for failed navigations
//! - **Registration**: per-scope waiting/active worker slots
//! - **Host shim**: event loop with explicit completion tokens
//!
//! ## Architecture
//!
//! ```text
//! WorkerContainer
//!     └── WorkerRegistration (per scope)
//!             ├── waiting (LifecycleController)
//!             └── active  (LifecycleController)
//!                     │
//!                     └── CacheStorage ── Cache "app-v1" ── RequestKey → CacheEntry
//! ```
//!
//! The controller owns no ambient state: the generation name and manifest
//! are injected at construction, and every handler is an explicit async
//! function whose returned future is the completion token the host awaits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offkit_cache::{CacheEntry, CacheError, CacheStorage, RequestKey};
use offkit_common::{FetchRequest, NetworkResponse};
use offkit_net::{NetError, NetworkAgent};

pub mod host;
pub mod registration;

pub use host::{spawn_worker, HostHandle};
pub use registration::{WorkerContainer, WorkerRegistration};

// ==================== Errors ====================

/// Errors from the worker lifecycle.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("No registration for scope: {0}")]
    NotRegistered(String),

    #[error("Worker task terminated")]
    Terminated,
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a worker.
///
/// Transitions are driven by the host delivering install/activate events;
/// the controller never advances itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkerState {
    /// No install attempted yet.
    #[default]
    Uninstalled,
    /// Install event running (precache in flight).
    Installing,
    /// Precache complete, waiting for activation.
    Installed,
    /// Activate event running (stale generations being pruned).
    Activating,
    /// Controlling fetches.
    Active,
    /// Replaced, or install failed.
    Redundant,
}

// ==================== Precache Manifest ====================

/// Static configuration for one worker version.
///
/// `resources` are paths resolved against `scope`; `offline_page` is
/// precached alongside them and remembered as the fallback for failed
/// navigations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecacheManifest {
    /// Cache generation this version owns (e.g. "app-v2").
    pub generation: String,

    /// Origin plus path prefix the worker controls.
    pub scope: Url,

    /// Paths to fetch and store at install time.
    pub resources: Vec<String>,

    /// Path of the offline fallback page.
    pub offline_page: String,
}

impl PrecacheManifest {
    /// Create a manifest.
    pub fn new(
        generation: impl Into<String>,
        scope: Url,
        resources: Vec<String>,
        offline_page: impl Into<String>,
    ) -> Self {
        Self {
            generation: generation.into(),
            scope,
            resources,
            offline_page: offline_page.into(),
        }
    }

    /// Load a manifest from a JSON file.
    pub async fn from_json_file(path: &std::path::Path) -> Result<Self, SwError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SwError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SwError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Absolute URLs of everything to precache. The offline page is always
    /// included, whether or not `resources` lists it.
    pub fn resource_urls(&self) -> Result<Vec<Url>, SwError> {
        let mut paths: Vec<&str> = self.resources.iter().map(String::as_str).collect();
        if !paths.contains(&self.offline_page.as_str()) {
            paths.push(&self.offline_page);
        }
        paths.into_iter().map(|p| self.resolve(p)).collect()
    }

    /// Absolute URL of the offline fallback page.
    pub fn offline_url(&self) -> Result<Url, SwError> {
        self.resolve(&self.offline_page)
    }

    fn resolve(&self, path: &str) -> Result<Url, SwError> {
        self.scope
            .join(path)
            .map_err(|e| SwError::Config(format!("bad resource path {path:?}: {e}")))
    }
}

// ==================== Fetch Outcome ====================

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    /// Precached entry for the request itself.
    Cache,
    /// Live network response (never written back).
    Network,
    /// The offline fallback page.
    OfflineFallback,
}

/// Response produced by the fetch-intercept handler.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Status code.
    pub status: u16,

    /// Status reason phrase.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Provenance of the response.
    pub served_from: ServedFrom,
}

impl FetchOutcome {
    /// Serve a cached entry verbatim.
    fn from_entry(entry: &CacheEntry, served_from: ServedFrom) -> Self {
        Self {
            status: entry.status,
            status_text: entry.status_text.clone(),
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            served_from,
        }
    }

    /// Pass a network response through.
    fn from_network(response: NetworkResponse) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body,
            served_from: ServedFrom::Network,
        }
    }
}

// ==================== Events ====================

/// Notifications emitted as workers move through their lifecycle.
#[derive(Debug, Clone)]
pub enum SwEvent {
    /// A worker changed state.
    StateChange {
        worker: WorkerId,
        generation: String,
        state: WorkerState,
    },
    /// A new worker version was registered for a scope.
    UpdateFound { scope: String },
    /// Install finished precaching.
    PrecacheComplete {
        generation: String,
        resources: usize,
    },
    /// Activate pruned stale generations.
    StaleGenerationsDeleted {
        generation: String,
        deleted: Vec<String>,
    },
    /// A failed navigation was answered with the offline page.
    OfflineFallbackServed { url: String },
}

// ==================== Lifecycle Controller ====================

/// One worker version: a state machine over an injected manifest, cache
/// storage handle, and network agent.
pub struct LifecycleController {
    id: WorkerId,
    manifest: PrecacheManifest,
    caches: Arc<RwLock<CacheStorage>>,
    network: Arc<dyn NetworkAgent>,
    state: WorkerState,
    error: Option<String>,
    events: Option<mpsc::UnboundedSender<SwEvent>>,
}

impl LifecycleController {
    /// Create a controller in the `Uninstalled` state.
    pub fn new(
        manifest: PrecacheManifest,
        caches: Arc<RwLock<CacheStorage>>,
        network: Arc<dyn NetworkAgent>,
    ) -> Self {
        Self {
            id: WorkerId::new(),
            manifest,
            caches,
            network,
            state: WorkerState::Uninstalled,
            error: None,
            events: None,
        }
    }

    /// Attach an event sink.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SwEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Worker ID.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Generation this version owns.
    pub fn generation(&self) -> &str {
        &self.manifest.generation
    }

    /// Scope this version controls.
    pub fn scope(&self) -> &Url {
        &self.manifest.scope
    }

    /// Error message from a failed install, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(worker = self.id.0, generation = %self.manifest.generation, ?state, "worker state change");
        self.state = state;
        self.emit(SwEvent::StateChange {
            worker: self.id,
            generation: self.manifest.generation.clone(),
            state,
        });
    }

    fn emit(&self, event: SwEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    /// Mark this worker redundant (replaced by a newer version).
    pub(crate) fn retire(&mut self) {
        self.set_state(WorkerState::Redundant);
    }

    /// Install: open the configured generation and precache the manifest.
    ///
    /// Single attempt. On failure a generation created by this install is
    /// rolled back, the worker goes `Redundant`, and the host is expected
    /// to retry with a fresh worker.
    pub async fn handle_install(&mut self) -> Result<(), SwError> {
        if self.state != WorkerState::Uninstalled {
            return Err(SwError::InvalidState(format!(
                "install delivered in {:?}",
                self.state
            )));
        }
        self.set_state(WorkerState::Installing);

        let urls = self.manifest.resource_urls()?;
        info!(generation = %self.manifest.generation, resources = urls.len(), "installing worker");

        let (result, created) = {
            let mut caches = self.caches.write().await;
            let created = !caches.has(&self.manifest.generation);
            let cache = caches.open(&self.manifest.generation);
            (cache.add_all(self.network.as_ref(), &urls).await, created)
        };

        match result {
            Ok(()) => {
                self.emit(SwEvent::PrecacheComplete {
                    generation: self.manifest.generation.clone(),
                    resources: urls.len(),
                });
                self.set_state(WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                // Roll back a generation this install created; one that
                // predates it still holds a complete set and is kept.
                if created {
                    self.caches.write().await.delete(&self.manifest.generation);
                }
                warn!(generation = %self.manifest.generation, error = %e, "install failed");
                self.error = Some(e.to_string());
                self.set_state(WorkerState::Redundant);
                Err(e.into())
            }
        }
    }

    /// Activate: delete every generation other than this worker's own.
    pub async fn handle_activate(&mut self) -> Result<(), SwError> {
        if self.state != WorkerState::Installed {
            return Err(SwError::InvalidState(format!(
                "activate delivered in {:?}",
                self.state
            )));
        }
        self.set_state(WorkerState::Activating);

        let deleted = {
            let mut caches = self.caches.write().await;
            let stale: Vec<String> = caches
                .generation_names()
                .into_iter()
                .filter(|name| name != &self.manifest.generation)
                .collect();
            for name in &stale {
                caches.delete(name);
            }
            stale
        };

        if !deleted.is_empty() {
            info!(generation = %self.manifest.generation, ?deleted, "pruned stale generations");
        }
        self.emit(SwEvent::StaleGenerationsDeleted {
            generation: self.manifest.generation.clone(),
            deleted,
        });
        self.set_state(WorkerState::Active);
        Ok(())
    }

    /// Fetch-intercept: cache-first within this worker's generation, then
    /// network, then the offline page for failed navigations.
    ///
    /// Network responses are never written back; only the precache manifest
    /// populates the cache.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, SwError> {
        if self.state != WorkerState::Active {
            return Err(SwError::InvalidState(format!(
                "fetch delivered in {:?}",
                self.state
            )));
        }

        let key = RequestKey::for_request(request);
        {
            let caches = self.caches.read().await;
            if let Some(entry) = caches
                .get(&self.manifest.generation)
                .and_then(|cache| cache.match_request(&key))
            {
                debug!(url = %request.url, "serving from cache");
                return Ok(FetchOutcome::from_entry(entry, ServedFrom::Cache));
            }
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                debug!(url = %request.url, status = response.status, "serving from network");
                Ok(FetchOutcome::from_network(response))
            }
            Err(e) => {
                if request.is_navigation() {
                    let offline_key = RequestKey::get(&self.manifest.offline_url()?);
                    let caches = self.caches.read().await;
                    if let Some(entry) = caches
                        .get(&self.manifest.generation)
                        .and_then(|cache| cache.match_request(&offline_key))
                    {
                        warn!(url = %request.url, "network down, serving offline page");
                        self.emit(SwEvent::OfflineFallbackServed {
                            url: request.url.to_string(),
                        });
                        return Ok(FetchOutcome::from_entry(entry, ServedFrom::OfflineFallback));
                    }
                }
                warn!(url = %request.url, error = %e, "fetch failed with no fallback");
                Err(e.into())
            }
        }
    }
}
