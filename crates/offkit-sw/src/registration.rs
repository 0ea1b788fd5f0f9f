//! Per-scope worker registrations.
//!
//! A registration tracks two worker versions for one scope: waiting
//! (installed, not yet controlling) and active. The container drives real
//! install/activate transitions on the controllers, and install runs to
//! completion inside [`WorkerContainer::register`], so a version only ever
//! appears in a slot once its precache actually committed.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offkit_cache::CacheStorage;
use offkit_common::FetchRequest;
use offkit_net::NetworkAgent;

use crate::{FetchOutcome, LifecycleController, PrecacheManifest, SwError, SwEvent, WorkerState};

// ==================== Registration ====================

/// Worker slots for one scope.
pub struct WorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Version installed and waiting for activation.
    pub waiting: Option<LifecycleController>,

    /// Version controlling fetches.
    pub active: Option<LifecycleController>,
}

impl WorkerRegistration {
    /// Create an empty registration for a scope.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            waiting: None,
            active: None,
        }
    }

    /// State of the active worker, if any.
    pub fn active_state(&self) -> Option<WorkerState> {
        self.active.as_ref().map(|w| w.state())
    }

    /// Whether a new version is waiting to take over.
    pub fn has_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    fn retire_all(&mut self) {
        for slot in [self.waiting.take(), self.active.take()] {
            if let Some(mut worker) = slot {
                worker.retire();
            }
        }
    }
}

// ==================== Container ====================

/// Registry of workers, one registration per scope.
///
/// The runtime-facing equivalent of `navigator.serviceWorker`: it registers
/// versions, promotes waiting workers, and routes intercepted fetches to
/// the active worker whose scope prefixes the request URL.
pub struct WorkerContainer {
    registrations: Arc<RwLock<HashMap<String, WorkerRegistration>>>,
    caches: Arc<RwLock<CacheStorage>>,
    network: Arc<dyn NetworkAgent>,
    event_tx: mpsc::UnboundedSender<SwEvent>,
}

impl WorkerContainer {
    /// Create a container over shared cache storage and a network agent.
    /// Returns the receiver for lifecycle events.
    pub fn new(
        caches: Arc<RwLock<CacheStorage>>,
        network: Arc<dyn NetworkAgent>,
    ) -> (Self, mpsc::UnboundedReceiver<SwEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                network,
                event_tx,
            },
            event_rx,
        )
    }

    /// Register a worker version and run its install.
    ///
    /// On success the version lands in the `waiting` slot (or is activated
    /// by [`activate`] / [`skip_waiting`] later). On install failure nothing
    /// is registered and the caller may retry.
    ///
    /// [`activate`]: WorkerContainer::activate
    /// [`skip_waiting`]: WorkerContainer::skip_waiting
    pub async fn register(&self, manifest: PrecacheManifest) -> Result<String, SwError> {
        let scope_key = manifest.scope.to_string();
        let scope = manifest.scope.clone();

        let mut worker =
            LifecycleController::new(manifest, self.caches.clone(), self.network.clone())
                .with_events(self.event_tx.clone());

        let _ = self.event_tx.send(SwEvent::UpdateFound {
            scope: scope_key.clone(),
        });

        worker.handle_install().await?;

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(scope_key.clone())
            .or_insert_with(|| WorkerRegistration::new(scope));

        if let Some(mut displaced) = registration.waiting.replace(worker) {
            // A newer version supersedes one that never activated.
            displaced.retire();
        }

        info!(scope = %scope_key, "worker registered and waiting");
        Ok(scope_key)
    }

    /// Promote the waiting worker for a scope: run activate, retire the
    /// previously active version.
    pub async fn activate(&self, scope: &str) -> Result<(), SwError> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope)
            .ok_or_else(|| SwError::NotRegistered(scope.to_string()))?;

        let mut worker = registration
            .waiting
            .take()
            .ok_or_else(|| SwError::InvalidState("no waiting worker".to_string()))?;

        match worker.handle_activate().await {
            Ok(()) => {
                if let Some(mut old) = registration.active.replace(worker) {
                    old.retire();
                }
                debug!(scope = %scope, "worker activated");
                Ok(())
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "activation failed");
                registration.waiting = Some(worker);
                Err(e)
            }
        }
    }

    /// Force-activate the waiting worker without waiting for the host's
    /// own schedule.
    pub async fn skip_waiting(&self, scope: &str) -> Result<(), SwError> {
        self.activate(scope).await
    }

    /// Remove a registration, retiring all its workers. Returns whether a
    /// registration existed.
    pub async fn unregister(&self, scope: &str) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                registration.retire_all();
                info!(scope = %scope, "worker unregistered");
                true
            }
            None => false,
        }
    }

    /// All registered scopes.
    pub async fn scopes(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// State of the active worker for a scope.
    pub async fn active_state(&self, scope: &str) -> Option<WorkerState> {
        self.registrations
            .read()
            .await
            .get(scope)
            .and_then(|r| r.active_state())
    }

    /// Find the registration scope controlling a URL: the longest
    /// registered prefix wins.
    pub async fn find_scope(&self, url: &Url) -> Option<String> {
        let registrations = self.registrations.read().await;
        registrations
            .keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// Route an intercepted fetch to the active worker for its scope.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, SwError> {
        let scope = self
            .find_scope(&request.url)
            .await
            .ok_or_else(|| SwError::NotRegistered(request.url.to_string()))?;

        let registrations = self.registrations.read().await;
        let worker = registrations
            .get(&scope)
            .and_then(|r| r.active.as_ref())
            .ok_or_else(|| SwError::InvalidState(format!("no active worker for {scope}")))?;

        worker.handle_fetch(request).await
    }
}
