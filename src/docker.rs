//! Container engine access and backend discovery
//!
//! The engine sits behind the [`ContainerEngine`] capability trait so tests
//! can substitute an in-memory fake for the real Docker daemon. On top of it,
//! [`Discovery`] translates engine records into [`Backend`] values: network
//! filtering, self-exclusion, label overrides, port detection, and
//! project-aware hostname resolution.

use crate::backend::{short_id, Backend};
use crate::hostname;
use crate::labels::{self, RouteOverrides, LABEL_COMPOSE_PROJECT, LABEL_COMPOSE_SERVICE};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout applied to every unary engine API call so an unresponsive daemon
/// cannot wedge the process.
const ENGINE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of raw engine events.
pub type EventStream = BoxStream<'static, Result<EventMessage>>;

/// Capability interface over the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// List summary records for containers matching the filter map.
    async fn list(&self, filters: HashMap<String, Vec<String>>) -> Result<Vec<ContainerSummary>>;

    /// Fetch the detailed record for one container.
    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse>;

    /// Subscribe to the filtered event stream.
    fn events(&self, filters: HashMap<String, Vec<String>>) -> EventStream;
}

/// The real engine client backed by `bollard`.
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon and verify it responds.
    ///
    /// Connection priority: `DOCKER_HOST`, then the conventional socket
    /// locations (Linux default, Docker Desktop, Colima, Rancher Desktop,
    /// Podman), then bollard's built-in default.
    pub async fn connect() -> Result<Self> {
        let client = if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow!(
                    "failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        tokio::time::timeout(ENGINE_CALL_TIMEOUT, client.ping())
            .await
            .context("Docker daemon ping timed out")?
            .map_err(|e| {
                anyhow!(
                    "Docker daemon is not responding: {}. \
                     Ensure Docker Desktop, Colima, or dockerd is running.",
                    e
                )
            })?;

        debug!("connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow!("cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow!("cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop", format!("{home}/.docker/run/docker.sock")),
            ("Colima", format!("{home}/.colima/default/docker.sock")),
            ("Rancher Desktop", format!("{home}/.rd/docker.sock")),
            ("Podman", format!("{xdg_runtime}/podman/podman.sock")),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue;
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow!(
                "cannot connect to Docker daemon: {}. \
                 Start dockerd or set DOCKER_HOST.",
                e
            )
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self, filters: HashMap<String, Vec<String>>) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            filters,
            ..Default::default()
        };
        tokio::time::timeout(ENGINE_CALL_TIMEOUT, self.client.list_containers(Some(options)))
            .await
            .context("container list timed out")?
            .context("failed to list containers")
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse> {
        tokio::time::timeout(
            ENGINE_CALL_TIMEOUT,
            self.client
                .inspect_container(container_id, None::<InspectContainerOptions>),
        )
        .await
        .context("container inspect timed out")?
        .with_context(|| format!("failed to inspect container {}", short_id(container_id)))
    }

    fn events(&self, filters: HashMap<String, Vec<String>>) -> EventStream {
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        self.client
            .events(Some(options))
            .map(|item| item.map_err(anyhow::Error::from))
            .boxed()
    }
}

/// Filter selecting containers attached to the watched network.
pub fn network_filter(network: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("network".to_string(), vec![network.to_string()])])
}

/// Filter selecting a compose project's containers on the watched network.
pub fn project_filter(network: &str, project: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("network".to_string(), vec![network.to_string()]),
        (
            "label".to_string(),
            vec![format!("{LABEL_COMPOSE_PROJECT}={project}")],
        ),
    ])
}

/// Filter restricting the event stream to container start/stop/die.
pub fn event_filter() -> HashMap<String, Vec<String>> {
    HashMap::from([
        ("type".to_string(), vec!["container".to_string()]),
        (
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string(), "die".to_string()],
        ),
    ])
}

/// Translates engine records into backends for the watched network.
pub struct Discovery {
    engine: Arc<dyn ContainerEngine>,
    network: String,
    base_domain: String,
}

impl Discovery {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        network: impl Into<String>,
        base_domain: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            network: network.into(),
            base_domain: base_domain.into(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Discover every routable container currently on the network.
    pub async fn discover_all(&self) -> Result<Vec<Backend>> {
        let containers = self.engine.list(network_filter(&self.network)).await?;
        let counts = hostname::project_service_counts(&containers);
        Ok(self.backends_from_summaries(&containers, &counts).await)
    }

    /// Re-derive every backend belonging to one compose project.
    pub async fn project_backends(&self, project: &str) -> Result<Vec<Backend>> {
        let containers = self
            .engine
            .list(project_filter(&self.network, project))
            .await?;
        let counts = hostname::project_service_counts(&containers);
        Ok(self.backends_from_summaries(&containers, &counts).await)
    }

    /// Build the backend for one container, if it is routable.
    ///
    /// Returns `Ok(None)` for containers that are skipped rather than failed:
    /// off-network, the proxy itself, or nothing listening on TCP.
    pub async fn backend_for(&self, container_id: &str) -> Result<Option<Backend>> {
        let info = self.engine.inspect(container_id).await?;

        let mut counts = HashMap::new();
        if let Some(project) = info
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(LABEL_COMPOSE_PROJECT))
            .filter(|p| !p.is_empty())
        {
            match self.count_project_services(project).await {
                Ok(count) => {
                    counts.insert(project.clone(), count);
                }
                Err(e) => {
                    warn!(project = %project, error = %e, "failed to count project services");
                    counts.insert(project.clone(), 1);
                }
            }
        }

        Ok(self.backend_from_inspect(&info, &counts))
    }

    async fn backends_from_summaries(
        &self,
        containers: &[ContainerSummary],
        counts: &HashMap<String, usize>,
    ) -> Vec<Backend> {
        let mut backends = Vec::new();
        for container in containers {
            let Some(id) = container.id.as_deref() else {
                continue;
            };
            match self.engine.inspect(id).await {
                Ok(info) => {
                    if let Some(backend) = self.backend_from_inspect(&info, counts) {
                        backends.push(backend);
                    }
                }
                Err(e) => {
                    warn!(container = short_id(id), error = %e, "failed to process container");
                }
            }
        }
        backends
    }

    async fn count_project_services(&self, project: &str) -> Result<usize> {
        let containers = self
            .engine
            .list(project_filter(&self.network, project))
            .await?;
        Ok(containers
            .iter()
            .filter(|c| {
                c.labels
                    .as_ref()
                    .map(|l| !labels::is_self(l))
                    .unwrap_or(true)
            })
            .count())
    }

    /// Map a detailed container record to a backend.
    fn backend_from_inspect(
        &self,
        info: &ContainerInspectResponse,
        counts: &HashMap<String, usize>,
    ) -> Option<Backend> {
        let container_id = info.id.clone()?;
        let container_name = info
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| short_id(&container_id).to_string());

        let empty = HashMap::new();
        let container_labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .unwrap_or(&empty);

        if labels::is_self(container_labels) {
            debug!(container = %container_name, "skipping proxy's own container");
            return None;
        }

        let host = info
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(&self.network))
            .and_then(|endpoint| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty());
        let Some(host) = host else {
            debug!(container = %container_name, network = %self.network, "no address on watched network");
            return None;
        };

        let overrides = RouteOverrides::parse(container_labels);

        let Some(port) = overrides.port.or_else(|| detect_port(info)) else {
            debug!(
                container = short_id(&container_id),
                name = %container_name,
                "no TCP port found for container"
            );
            return None;
        };

        let project_name = container_labels
            .get(LABEL_COMPOSE_PROJECT)
            .cloned()
            .unwrap_or_default();
        let service_name = container_labels
            .get(LABEL_COMPOSE_SERVICE)
            .cloned()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| container_name.clone());

        let hostname = overrides.host.unwrap_or_else(|| {
            hostname::resolve(
                &service_name,
                &project_name,
                &container_name,
                &self.base_domain,
                counts,
            )
        });

        Some(Backend {
            container_id,
            container_name,
            service_name,
            project_name,
            host,
            port,
            hostname: hostname.to_lowercase(),
            path_prefix: overrides.path_prefix.unwrap_or_default(),
        })
    }
}

/// Detect the container's TCP port.
///
/// The image's exposed-port list is preferred; the published-port list is the
/// fallback. Keys are sorted so the choice is stable across engine calls.
fn detect_port(info: &ContainerInspectResponse) -> Option<u16> {
    if let Some(exposed) = info.config.as_ref().and_then(|c| c.exposed_ports.as_ref()) {
        if let Some(port) = first_tcp_port(exposed.keys()) {
            return Some(port);
        }
    }

    if let Some(ports) = info
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref())
    {
        if let Some(port) = first_tcp_port(ports.keys()) {
            return Some(port);
        }
    }

    None
}

/// First numerically-parseable TCP port among `"<port>/<proto>"` specs.
fn first_tcp_port<'a>(specs: impl Iterator<Item = &'a String>) -> Option<u16> {
    let mut specs: Vec<&String> = specs.collect();
    specs.sort();
    specs.into_iter().find_map(|spec| {
        let (port, proto) = match spec.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (spec.as_str(), "tcp"),
        };
        if !proto.eq_ignore_ascii_case("tcp") {
            return None;
        }
        port.parse::<u16>().ok().filter(|p| *p > 0)
    })
}
