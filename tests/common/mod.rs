//! In-memory container engine for integration tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerSummary, ContainerSummaryNetworkSettings,
    EndpointSettings, EventActor, EventMessage, NetworkSettings,
};
use futures::StreamExt;
use parking_lot::Mutex;
use roji::docker::{ContainerEngine, EventStream};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Declarative description of one fake container.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// network name -> IP address
    pub networks: HashMap<String, String>,
    /// exposed port specs, e.g. `"80/tcp"`
    pub exposed_ports: Vec<String>,
    /// stopped containers stay inspectable but drop out of listings,
    /// matching the engine's behaviour until a container is removed
    pub running: bool,
}

impl FakeContainer {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            labels: HashMap::new(),
            networks: HashMap::new(),
            exposed_ports: Vec::new(),
            running: true,
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn compose(self, project: &str, service: &str) -> Self {
        self.label("com.docker.compose.project", project)
            .label("com.docker.compose.service", service)
    }

    pub fn on_network(mut self, network: &str, ip: &str) -> Self {
        self.networks.insert(network.to_string(), ip.to_string());
        self
    }

    pub fn exposing(mut self, spec: &str) -> Self {
        self.exposed_ports.push(spec.to_string());
        self
    }

    fn summary(&self) -> ContainerSummary {
        let networks: HashMap<String, EndpointSettings> = self
            .networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.clone(),
                    EndpointSettings {
                        ip_address: Some(ip.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        ContainerSummary {
            id: Some(self.id.clone()),
            names: Some(vec![format!("/{}", self.name)]),
            labels: Some(self.labels.clone()),
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(networks),
            }),
            ..Default::default()
        }
    }

    fn inspect(&self) -> ContainerInspectResponse {
        let networks: HashMap<String, EndpointSettings> = self
            .networks
            .iter()
            .map(|(name, ip)| {
                (
                    name.clone(),
                    EndpointSettings {
                        ip_address: Some(ip.clone()),
                        ..Default::default()
                    },
                )
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .exposed_ports
            .iter()
            .map(|spec| (spec.clone(), HashMap::new()))
            .collect();

        ContainerInspectResponse {
            id: Some(self.id.clone()),
            name: Some(format!("/{}", self.name)),
            config: Some(ContainerConfig {
                labels: Some(self.labels.clone()),
                exposed_ports: if exposed_ports.is_empty() {
                    None
                } else {
                    Some(exposed_ports)
                },
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Programmable in-memory engine: containers are added and removed by the
/// test, lifecycle events are injected explicitly.
pub struct FakeEngine {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    events: broadcast::Sender<EventMessage>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            containers: Mutex::new(BTreeMap::new()),
            events,
        })
    }

    pub fn add_container(&self, container: FakeContainer) {
        self.containers
            .lock()
            .insert(container.id.clone(), container);
    }

    pub fn remove_container(&self, id: &str) {
        self.containers.lock().remove(id);
    }

    /// Mark a container stopped: gone from listings, still inspectable.
    pub fn stop_container(&self, id: &str) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.running = false;
        }
    }

    pub fn emit_start(&self, id: &str) {
        let _ = self.events.send(event(id, "start"));
    }

    pub fn emit_stop(&self, id: &str) {
        let _ = self.events.send(event(id, "stop"));
    }
}

fn event(id: &str, action: &str) -> EventMessage {
    EventMessage {
        action: Some(action.to_string()),
        actor: Some(EventActor {
            id: Some(id.to_string()),
            attributes: Some(HashMap::new()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn matches_filters(container: &FakeContainer, filters: &HashMap<String, Vec<String>>) -> bool {
    if let Some(networks) = filters.get("network") {
        if !networks
            .iter()
            .any(|network| container.networks.contains_key(network))
        {
            return false;
        }
    }

    if let Some(label_filters) = filters.get("label") {
        for filter in label_filters {
            let matched = match filter.split_once('=') {
                Some((key, value)) => container.labels.get(key).map(String::as_str) == Some(value),
                None => container.labels.contains_key(filter),
            };
            if !matched {
                return false;
            }
        }
    }

    true
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self, filters: HashMap<String, Vec<String>>) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|container| container.running && matches_filters(container, &filters))
            .map(FakeContainer::summary)
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse> {
        self.containers
            .lock()
            .get(container_id)
            .map(FakeContainer::inspect)
            .ok_or_else(|| anyhow::anyhow!("no such container: {container_id}"))
    }

    fn events(&self, _filters: HashMap<String, Vec<String>>) -> EventStream {
        let rx = self.events.subscribe();
        unfold_events(rx).boxed()
    }
}

fn unfold_events(
    rx: broadcast::Receiver<EventMessage>,
) -> impl futures::Stream<Item = Result<EventMessage>> {
    futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(message) => Some((Ok(message), rx)),
            Err(broadcast::error::RecvError::Lagged(_)) => {
                Some((Err(anyhow::anyhow!("event stream lagged")), rx))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}
