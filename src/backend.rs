//! Backend model: one reachable container endpoint

use serde::Serialize;

/// A proxied container endpoint, immutable once constructed.
///
/// Identified by its container ID; two backends with the same ID describe the
/// same container at different points in time and the newer one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// Opaque identifier assigned by the container engine
    pub container_id: String,
    /// Display name (leading `/` already stripped)
    pub container_name: String,
    /// Compose service name, falling back to the container name
    pub service_name: String,
    /// Compose project name; empty for standalone containers
    pub project_name: String,
    /// Container IP on the watched network
    pub host: String,
    /// TCP port on `host`
    pub port: u16,
    /// Fully-qualified hostname clients use (lowercase)
    pub hostname: String,
    /// Canonical URL path prefix; empty means "default route for host"
    pub path_prefix: String,
}

impl Backend {
    /// The upstream address requests are forwarded to.
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shortened container ID for log fields (engine IDs are 64 hex chars).
    pub fn short_id(&self) -> &str {
        short_id(&self.container_id)
    }
}

/// First 12 characters of a container ID, or the full ID if shorter.
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
