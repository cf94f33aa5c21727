//! Hostname resolution for discovered containers

use crate::labels::{self, LABEL_COMPOSE_PROJECT};
use bollard::models::ContainerSummary;
use std::collections::HashMap;

/// Compute the canonical hostname for a container.
///
/// Single-service projects get the short `<project>.<base>` form; projects
/// with two or more services get a per-service `<service>.<project>.<base>`
/// namespace; standalone containers fall back to `<container>.<base>`.
pub fn resolve(
    service_name: &str,
    project_name: &str,
    container_name: &str,
    base_domain: &str,
    project_service_counts: &HashMap<String, usize>,
) -> String {
    if !project_name.is_empty() && !service_name.is_empty() {
        let count = project_service_counts
            .get(project_name)
            .copied()
            .unwrap_or(0);
        if count <= 1 {
            return format!("{project_name}.{base_domain}");
        }
        return format!("{service_name}.{project_name}.{base_domain}");
    }

    format!("{container_name}.{base_domain}")
}

/// Count active services per compose project over one discovery pass.
///
/// Computed once per pass so every sibling sees the same count and hostnames
/// come out consistent. The proxy's own container is excluded.
pub fn project_service_counts(containers: &[ContainerSummary]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for container in containers {
        let Some(container_labels) = container.labels.as_ref() else {
            continue;
        };
        if labels::is_self(container_labels) {
            continue;
        }
        if let Some(project) = container_labels.get(LABEL_COMPOSE_PROJECT) {
            if !project.is_empty() {
                *counts.entry(project.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LABEL_COMPOSE_SERVICE, LABEL_SELF};

    fn counts(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_single_service_project_uses_project_name() {
        let hostname = resolve("web", "myapp", "myapp-web-1", "dev.localhost", &counts(&[("myapp", 1)]));
        assert_eq!(hostname, "myapp.dev.localhost");
    }

    #[test]
    fn test_multi_service_project_uses_service_namespace() {
        let c = counts(&[("myapp", 2)]);
        assert_eq!(
            resolve("web", "myapp", "myapp-web-1", "dev.localhost", &c),
            "web.myapp.dev.localhost"
        );
        assert_eq!(
            resolve("api", "myapp", "myapp-api-1", "dev.localhost", &c),
            "api.myapp.dev.localhost"
        );
    }

    #[test]
    fn test_standalone_container_uses_container_name() {
        let hostname = resolve("", "", "redis", "dev.localhost", &counts(&[]));
        assert_eq!(hostname, "redis.dev.localhost");
    }

    #[test]
    fn test_unknown_project_count_defaults_to_short_form() {
        let hostname = resolve("web", "myapp", "myapp-web-1", "dev.localhost", &counts(&[]));
        assert_eq!(hostname, "myapp.dev.localhost");
    }

    #[test]
    fn test_project_service_counts_skips_self() {
        let mk = |project: Option<&str>, is_self: bool| {
            let mut labels = HashMap::new();
            if let Some(p) = project {
                labels.insert(LABEL_COMPOSE_PROJECT.to_string(), p.to_string());
                labels.insert(LABEL_COMPOSE_SERVICE.to_string(), "svc".to_string());
            }
            if is_self {
                labels.insert(LABEL_SELF.to_string(), "true".to_string());
            }
            ContainerSummary {
                labels: Some(labels),
                ..Default::default()
            }
        };

        let containers = vec![
            mk(Some("a"), false),
            mk(Some("a"), false),
            mk(Some("b"), false),
            mk(Some("b"), true),
            mk(None, false),
        ];

        let counts = project_service_counts(&containers);
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
        assert_eq!(counts.len(), 2);
    }
}
