//! Host event-loop shim.
//!
//! The hosting environment delivers lifecycle and fetch events one at a
//! time and must keep the process alive until each handler's pending work
//! resolves. This module renders that contract explicitly: every event
//! carries a oneshot completion sender, and the worker task fulfills it
//! only once the handler's future has finished. Nothing here retries;
//! a failed event is reported back to the host as-is.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use offkit_common::FetchRequest;

use crate::{FetchOutcome, LifecycleController, SwError};

/// An event delivered by the host, with its completion token.
enum HostEvent {
    Install(oneshot::Sender<Result<(), SwError>>),
    Activate(oneshot::Sender<Result<(), SwError>>),
    Fetch(
        Box<FetchRequest>,
        oneshot::Sender<Result<FetchOutcome, SwError>>,
    ),
}

/// Handle held by the host to deliver events to a running worker task.
pub struct HostHandle {
    event_tx: mpsc::UnboundedSender<HostEvent>,
    task: tokio::task::JoinHandle<LifecycleController>,
}

/// Move a controller onto its own task and return the host's handle to it.
///
/// Events are processed strictly in delivery order; a handler must finish
/// before the next event is dequeued.
pub fn spawn_worker(mut controller: LifecycleController) -> HostHandle {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                HostEvent::Install(done) => {
                    let _ = done.send(controller.handle_install().await);
                }
                HostEvent::Activate(done) => {
                    let _ = done.send(controller.handle_activate().await);
                }
                HostEvent::Fetch(request, done) => {
                    let _ = done.send(controller.handle_fetch(&request).await);
                }
            }
        }
        debug!(worker = ?controller.id(), "host channel closed, worker task ending");
        controller
    });

    HostHandle { event_tx, task }
}

impl HostHandle {
    /// Deliver the install event and await its completion.
    pub async fn install(&self) -> Result<(), SwError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.event_tx
            .send(HostEvent::Install(done_tx))
            .map_err(|_| SwError::Terminated)?;
        done_rx.await.map_err(|_| SwError::Terminated)?
    }

    /// Deliver the activate event and await its completion.
    pub async fn activate(&self) -> Result<(), SwError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.event_tx
            .send(HostEvent::Activate(done_tx))
            .map_err(|_| SwError::Terminated)?;
        done_rx.await.map_err(|_| SwError::Terminated)?
    }

    /// Deliver a fetch event and await the response.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, SwError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.event_tx
            .send(HostEvent::Fetch(Box::new(request), done_tx))
            .map_err(|_| SwError::Terminated)?;
        done_rx.await.map_err(|_| SwError::Terminated)?
    }

    /// Stop delivering events and take the controller back.
    pub async fn shutdown(self) -> Result<LifecycleController, SwError> {
        drop(self.event_tx);
        self.task.await.map_err(|_| SwError::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrecacheManifest, ServedFrom, WorkerState};
    use offkit_cache::CacheStorage;
    use offkit_net::StaticAgent;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use url::Url;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn spawn_test_worker() -> (HostHandle, Arc<StaticAgent>) {
        let agent = StaticAgent::new();
        agent.route_ok(&url("https://app.example/index.html"), "<html>").await;
        agent.route_ok(&url("https://app.example/offline.html"), "offline").await;
        let agent = Arc::new(agent);

        let manifest = PrecacheManifest::new(
            "v1",
            url("https://app.example/"),
            vec!["/index.html".to_string()],
            "/offline.html",
        );
        let controller = LifecycleController::new(
            manifest,
            Arc::new(RwLock::new(CacheStorage::new())),
            agent.clone(),
        );
        (spawn_worker(controller), agent)
    }

    #[tokio::test]
    async fn test_host_drives_full_lifecycle() {
        let (host, _agent) = spawn_test_worker().await;

        host.install().await.unwrap();
        host.activate().await.unwrap();

        let outcome = host
            .fetch(offkit_common::FetchRequest::get(url(
                "https://app.example/index.html",
            )))
            .await
            .unwrap();
        assert_eq!(outcome.served_from, ServedFrom::Cache);

        let controller = host.shutdown().await.unwrap();
        assert_eq!(controller.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn test_host_reports_handler_failures() {
        let (host, agent) = spawn_test_worker().await;
        agent.set_offline(true);

        assert!(host.install().await.is_err());
        // The worker failed its install; activate is a state error, not a hang.
        assert!(host.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_events_are_processed_in_order() {
        let (host, _agent) = spawn_test_worker().await;

        // Deliver install and activate back to back; ordering guarantees
        // activate sees the Installed state.
        let (install_done_tx, install_done_rx) = oneshot::channel();
        let (activate_done_tx, activate_done_rx) = oneshot::channel();
        host.event_tx
            .send(HostEvent::Install(install_done_tx))
            .unwrap();
        host.event_tx
            .send(HostEvent::Activate(activate_done_tx))
            .unwrap();

        assert!(install_done_rx.await.unwrap().is_ok());
        assert!(activate_done_rx.await.unwrap().is_ok());
    }
}
