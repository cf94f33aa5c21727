//! Container-label parsing for per-route overrides

use std::collections::HashMap;
use tracing::debug;

/// Prefix shared by all routing labels
pub const LABEL_PREFIX: &str = "roji.";

/// Overrides the resolved hostname verbatim
pub const LABEL_HOST: &str = "roji.host";
/// Overrides port detection
pub const LABEL_PORT: &str = "roji.port";
/// Sets the route's path prefix
pub const LABEL_PATH: &str = "roji.path";
/// Marks the proxy's own container; excluded from discovery
pub const LABEL_SELF: &str = "roji.self";

/// Compose project label, drives hostname resolution and project refreshes
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
/// Compose service label, used as the default subdomain
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";

/// Route overrides extracted from container labels.
///
/// Parsing never fails: malformed values are downgraded to unset so one
/// misconfigured label cannot keep other containers from being routed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOverrides {
    /// Hostname override, used verbatim
    pub host: Option<String>,
    /// Target port override
    pub port: Option<u16>,
    /// Canonicalised path prefix
    pub path_prefix: Option<String>,
}

impl RouteOverrides {
    /// Extract route overrides from a container's label map.
    pub fn parse(labels: &HashMap<String, String>) -> Self {
        let mut overrides = Self::default();

        if let Some(host) = labels.get(LABEL_HOST) {
            let host = host.trim();
            if !host.is_empty() {
                overrides.host = Some(host.to_string());
            }
        }

        if let Some(port) = labels.get(LABEL_PORT) {
            match port.trim().parse::<u16>() {
                Ok(p) if p > 0 => overrides.port = Some(p),
                _ => debug!(value = %port, "ignoring unparseable port label"),
            }
        }

        if let Some(path) = labels.get(LABEL_PATH) {
            let canonical = canonicalize_path_prefix(path);
            if canonical.is_empty() && !path.trim().is_empty() {
                debug!(value = %path, "ignoring path label that escapes the root");
            }
            overrides.path_prefix = Some(canonical);
        }

        overrides
    }
}

/// Whether a label map marks the proxy's own container.
pub fn is_self(labels: &HashMap<String, String>) -> bool {
    labels.get(LABEL_SELF).map(String::as_str) == Some("true")
}

/// Canonicalise a path-prefix label value.
///
/// Any `..` segment is rejected (the prefix would escape the root when
/// resolved against `/`) and replaced with the empty string. A trailing slash
/// is stripped unless the result is exactly `/`. The empty input yields `/`,
/// which the routing table treats as the default route for the host.
pub fn canonicalize_path_prefix(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }

    if trimmed.split('/').any(|segment| segment == "..") {
        return String::new();
    }

    let mut path = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };

    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    path
}
