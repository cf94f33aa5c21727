//! Container lifecycle observer
//!
//! Runs an initial full scan and then follows the engine's event stream,
//! translating container starts and stops into [`RouteDelta`] messages. A
//! single consumer applies the deltas to the routing table in emission order,
//! which keeps project refreshes atomic.

use crate::backend::{short_id, Backend};
use crate::docker::{event_filter, Discovery};
use crate::router::RoutingTable;
use bollard::models::EventMessage;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Delay between attempts to re-establish the event stream
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the delta channel between observer and table writer
pub const DELTA_CHANNEL_CAPACITY: usize = 64;

/// A change observed in the set of routable containers.
#[derive(Debug)]
pub enum RouteDelta {
    /// A routable container appeared
    Appeared(Backend),
    /// A container went away; all its routes are dropped
    Gone { container_id: String },
    /// A compose project's membership changed; swap all its routes at once
    ProjectRefresh {
        project: String,
        backends: Vec<Backend>,
    },
}

/// Watches the engine and emits route deltas.
pub struct Observer {
    discovery: Arc<Discovery>,
    connected: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Observer {
    pub fn new(discovery: Arc<Discovery>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            discovery,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_rx,
        }
    }

    /// Flag tracking whether the event stream is currently established.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    /// Scan all containers currently on the network and emit one
    /// `Appeared` delta per routable backend.
    ///
    /// Failure here is startup-fatal: without a successful scan the routing
    /// table would silently start empty.
    pub async fn initial_scan(&self, tx: &mpsc::Sender<RouteDelta>) -> anyhow::Result<()> {
        let backends = self.discovery.discover_all().await?;
        let count = backends.len();

        for backend in backends {
            if tx.send(RouteDelta::Appeared(backend)).await.is_err() {
                anyhow::bail!("delta consumer stopped during initial scan");
            }
        }

        info!(count, "discovered existing containers");
        Ok(())
    }

    /// Follow the engine's event stream until shutdown.
    ///
    /// The stream terminates when the engine restarts; it is re-established
    /// on a fixed backoff. The routing table stays authoritative between
    /// reconnects, so no rescan happens here.
    pub async fn run(mut self, tx: mpsc::Sender<RouteDelta>) {
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.watch_events(&tx).await;
            self.connected.store(false, Ordering::Relaxed);

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {
                    info!("reconnecting to container events");
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("observer stopped");
    }

    /// Drain one event-stream connection.
    async fn watch_events(&mut self, tx: &mpsc::Sender<RouteDelta>) {
        let mut events = self.discovery.engine().events(event_filter());
        self.connected.store(true, Ordering::Relaxed);

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(Ok(message)) => self.handle_event(message, tx).await,
                        Some(Err(e)) => {
                            error!(error = %e, "container event stream error, will reconnect");
                            return;
                        }
                        None => {
                            error!("container event stream closed, will reconnect");
                            return;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, message: EventMessage, tx: &mpsc::Sender<RouteDelta>) {
        let Some(container_id) = message.actor.as_ref().and_then(|actor| actor.id.clone()) else {
            return;
        };
        let name = message
            .actor
            .as_ref()
            .and_then(|actor| actor.attributes.as_ref())
            .and_then(|attributes| attributes.get("name").cloned())
            .unwrap_or_default();

        match message.action.as_deref() {
            Some("start") => {
                debug!(container = short_id(&container_id), name = %name, "container started");
                self.handle_start(&container_id, tx).await;
            }
            Some("stop") | Some("die") => {
                debug!(container = short_id(&container_id), name = %name, "container stopped");
                self.handle_stop(&container_id, tx).await;
            }
            _ => {}
        }
    }

    async fn handle_start(&self, container_id: &str, tx: &mpsc::Sender<RouteDelta>) {
        let backend = match self.discovery.backend_for(container_id).await {
            Ok(Some(backend)) => backend,
            Ok(None) => return,
            Err(e) => {
                error!(container = short_id(container_id), error = %e, "failed to resolve started container");
                return;
            }
        };

        // Sibling hostnames shift between the single- and multi-service
        // shapes when project membership changes, so a compose container
        // triggers a whole-project refresh instead of a plain add.
        if backend.project_name.is_empty() {
            let _ = tx.send(RouteDelta::Appeared(backend)).await;
        } else {
            self.refresh_project(&backend.project_name, tx).await;
        }
    }

    async fn handle_stop(&self, container_id: &str, tx: &mpsc::Sender<RouteDelta>) {
        // Best-effort: the container may already be gone from the engine.
        let project = match self.discovery.backend_for(container_id).await {
            Ok(Some(backend)) if !backend.project_name.is_empty() => Some(backend.project_name),
            _ => None,
        };

        let _ = tx
            .send(RouteDelta::Gone {
                container_id: container_id.to_string(),
            })
            .await;

        if let Some(project) = project {
            self.refresh_project(&project, tx).await;
        }
    }

    async fn refresh_project(&self, project: &str, tx: &mpsc::Sender<RouteDelta>) {
        match self.discovery.project_backends(project).await {
            Ok(backends) => {
                let _ = tx
                    .send(RouteDelta::ProjectRefresh {
                        project: project.to_string(),
                        backends,
                    })
                    .await;
            }
            Err(e) => {
                error!(project = %project, error = %e, "failed to refresh project backends");
            }
        }
    }
}

/// Apply observer deltas to the routing table, in order.
///
/// The single consumer is what makes a project refresh an atomic replacement:
/// mutations are serialised here rather than spawned per event.
pub async fn apply_deltas(table: Arc<RoutingTable>, mut rx: mpsc::Receiver<RouteDelta>) {
    while let Some(delta) = rx.recv().await {
        match delta {
            RouteDelta::Appeared(backend) => table.add(backend),
            RouteDelta::Gone { container_id } => table.remove_by_container(&container_id),
            RouteDelta::ProjectRefresh { project, backends } => {
                table.replace_project(&project, backends)
            }
        }
    }
    debug!("delta channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str, project: &str, hostname: &str) -> Backend {
        Backend {
            container_id: id.to_string(),
            container_name: id.to_string(),
            service_name: id.to_string(),
            project_name: project.to_string(),
            host: "10.0.0.5".to_string(),
            port: 80,
            hostname: hostname.to_string(),
            path_prefix: String::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_deltas_in_order() {
        let table = Arc::new(RoutingTable::new());
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let consumer = tokio::spawn(apply_deltas(Arc::clone(&table), rx));

        tx.send(RouteDelta::Appeared(backend("a", "", "a.localhost")))
            .await
            .unwrap();
        tx.send(RouteDelta::Appeared(backend("b", "", "b.localhost")))
            .await
            .unwrap();
        tx.send(RouteDelta::Gone {
            container_id: "a".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        consumer.await.unwrap();

        assert!(table.lookup("a.localhost", "/").is_none());
        assert!(table.lookup("b.localhost", "/").is_some());
    }

    #[tokio::test]
    async fn test_apply_project_refresh_replaces_hostnames() {
        let table = Arc::new(RoutingTable::new());
        table.add(backend("web1", "p", "p.dev.localhost"));

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let consumer = tokio::spawn(apply_deltas(Arc::clone(&table), rx));

        tx.send(RouteDelta::ProjectRefresh {
            project: "p".to_string(),
            backends: vec![
                backend("web1", "p", "web.p.dev.localhost"),
                backend("api1", "p", "api.p.dev.localhost"),
            ],
        })
        .await
        .unwrap();
        drop(tx);
        consumer.await.unwrap();

        assert!(table.lookup("p.dev.localhost", "/").is_none());
        assert!(table.lookup("web.p.dev.localhost", "/").is_some());
        assert!(table.lookup("api.p.dev.localhost", "/").is_some());
    }
}
