//! Concurrent routing table mapping (hostname, path) to backends

use crate::backend::Backend;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One `(hostname, path_prefix) -> backend` binding.
#[derive(Debug, Clone)]
pub struct Route {
    pub hostname: String,
    /// Empty for the host's default route
    pub path_prefix: String,
    pub backend: Arc<Backend>,
}

/// Display-friendly, by-value copy of a route for snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub hostname: String,
    pub path_prefix: String,
    pub target: String,
    pub service_name: String,
    pub container_name: String,
    pub project_name: String,
}

impl RouteEntry {
    fn from_route(route: &Route) -> Self {
        Self {
            hostname: route.hostname.clone(),
            path_prefix: route.path_prefix.clone(),
            target: route.backend.target_addr(),
            service_name: route.backend.service_name.clone(),
            container_name: route.backend.container_name.clone(),
            project_name: route.backend.project_name.clone(),
        }
    }

    /// Human-readable route line for the dashboard.
    pub fn describe(&self) -> String {
        let path = if self.path_prefix.is_empty() {
            "/"
        } else {
            self.path_prefix.as_str()
        };
        format!(
            "https://{}{} -> {} ({})",
            self.hostname, path, self.target, self.service_name
        )
    }
}

/// Read side of the routing table, as the dispatcher consumes it.
///
/// The dispatcher is polymorphic over this capability so tests can hand it a
/// canned table.
pub trait RouteLookup: Send + Sync {
    /// Find the route for a hostname and request path.
    fn lookup(&self, hostname: &str, path: &str) -> Option<Route>;

    /// All routes, ordered, copied by value.
    fn snapshot(&self) -> Vec<RouteEntry>;
}

#[derive(Default)]
struct Indices {
    /// Default route per hostname
    routes: HashMap<String, Route>,
    /// Path-prefixed routes per hostname, longest prefix first
    path_routes: HashMap<String, Vec<Route>>,
}

impl Indices {
    fn retain_backends<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Backend) -> bool,
    {
        self.routes.retain(|_, route| {
            let kept = keep(&route.backend);
            if !kept {
                info!(
                    hostname = %route.hostname,
                    container = %route.backend.container_name,
                    "route removed"
                );
            }
            kept
        });

        self.path_routes.retain(|_, routes| {
            routes.retain(|route| {
                let kept = keep(&route.backend);
                if !kept {
                    info!(
                        hostname = %route.hostname,
                        path = %route.path_prefix,
                        container = %route.backend.container_name,
                        "route removed"
                    );
                }
                kept
            });
            !routes.is_empty()
        });
    }

    fn insert(&mut self, backend: Backend) {
        let hostname = backend.hostname.to_lowercase();
        let path_prefix = if backend.path_prefix.is_empty() || backend.path_prefix == "/" {
            String::new()
        } else {
            backend.path_prefix.clone()
        };

        info!(
            hostname = %hostname,
            path = %backend.path_prefix,
            target = %backend.target_addr(),
            container = %backend.container_name,
            "route added"
        );

        let route = Route {
            hostname: hostname.clone(),
            path_prefix: path_prefix.clone(),
            backend: Arc::new(backend),
        };

        if path_prefix.is_empty() {
            self.routes.insert(hostname, route);
        } else {
            let routes = self.path_routes.entry(hostname).or_default();
            // A later insert with the same (hostname, prefix) replaces the
            // earlier route and retires its backend immediately.
            routes.retain(|existing| existing.path_prefix != path_prefix);
            routes.push(route);
            routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        }
    }
}

/// Thread-safe routing table.
///
/// Both indices live under one lock so every mutation is atomic with respect
/// to concurrent lookups: a lookup observes the table before or after a
/// mutation, never a partially-rebuilt hostname.
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Indices>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the route for a backend.
    pub fn add(&self, backend: Backend) {
        self.inner.write().insert(backend);
    }

    /// Remove every route whose backend carries the given container ID.
    pub fn remove_by_container(&self, container_id: &str) {
        self.inner
            .write()
            .retain_backends(|backend| backend.container_id != container_id);
    }

    /// Remove every route whose backend carries the given project name.
    pub fn remove_by_project(&self, project_name: &str) {
        self.inner
            .write()
            .retain_backends(|backend| backend.project_name != project_name);
    }

    /// Atomically swap a project's routes for a freshly-discovered set.
    ///
    /// Hostnames shift between the single- and multi-service shapes when
    /// project membership changes, so the removal and the re-adds must land
    /// in one critical section: no lookup may observe siblings half-gone.
    pub fn replace_project(&self, project_name: &str, backends: Vec<Backend>) {
        let mut inner = self.inner.write();
        debug!(project = %project_name, count = backends.len(), "refreshing project routes");
        inner.retain_backends(|backend| backend.project_name != project_name);
        for backend in backends {
            inner.insert(backend);
        }
    }

    /// Find the route for a hostname and request path.
    ///
    /// Path-prefixed routes are consulted longest-prefix-first; the host's
    /// default route is the fallback.
    pub fn lookup(&self, hostname: &str, path: &str) -> Option<Route> {
        let hostname = hostname.to_lowercase();
        let inner = self.inner.read();

        if let Some(routes) = inner.path_routes.get(&hostname) {
            for route in routes {
                if path.starts_with(&route.path_prefix) {
                    return Some(route.clone());
                }
            }
        }

        inner.routes.get(&hostname).cloned()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.routes.len() + inner.path_routes.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All routes, sorted by hostname then path prefix, copied by value.
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let inner = self.inner.read();

        let mut entries: Vec<RouteEntry> = inner
            .routes
            .values()
            .chain(inner.path_routes.values().flatten())
            .map(RouteEntry::from_route)
            .collect();

        entries.sort_by(|a, b| {
            a.hostname
                .cmp(&b.hostname)
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });

        entries
    }
}

impl RouteLookup for RoutingTable {
    fn lookup(&self, hostname: &str, path: &str) -> Option<Route> {
        RoutingTable::lookup(self, hostname, path)
    }

    fn snapshot(&self) -> Vec<RouteEntry> {
        RoutingTable::snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: &str, hostname: &str, path_prefix: &str) -> Backend {
        Backend {
            container_id: id.to_string(),
            container_name: id.to_string(),
            service_name: id.to_string(),
            project_name: String::new(),
            host: "172.18.0.2".to_string(),
            port: 80,
            hostname: hostname.to_string(),
            path_prefix: path_prefix.to_string(),
        }
    }

    fn project_backend(id: &str, project: &str, hostname: &str) -> Backend {
        Backend {
            project_name: project.to_string(),
            ..backend(id, hostname, "")
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let table = RoutingTable::new();
        table.add(backend("abc123", "web.localhost", ""));

        let route = table.lookup("web.localhost", "/").expect("route");
        assert_eq!(route.backend.container_id, "abc123");

        assert!(table.lookup("api.localhost", "/").is_none());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = RoutingTable::new();
        table.add(backend("abc123", "WEB.Localhost", ""));

        assert!(table.lookup("web.localhost", "/").is_some());
        assert!(table.lookup("WEB.LOCALHOST", "/").is_some());
        assert!(table.lookup("Web.Localhost", "/x").is_some());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RoutingTable::new();
        table.add(backend("web123", "app.localhost", ""));
        table.add(backend("api123", "app.localhost", "/api"));
        table.add(backend("apiv2", "app.localhost", "/api/v2"));

        let cases = [
            ("/api/v2/users", "apiv2"),
            ("/api/users", "api123"),
            ("/", "web123"),
            ("/other", "web123"),
        ];
        for (path, expected) in cases {
            let route = table.lookup("app.localhost", path).expect("route");
            assert_eq!(route.backend.container_id, expected, "path {path}");
        }
    }

    #[test]
    fn test_slash_prefix_is_default_route() {
        let table = RoutingTable::new();
        table.add(backend("abc123", "web.localhost", "/"));

        let route = table.lookup("web.localhost", "/anything").expect("route");
        assert_eq!(route.path_prefix, "");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_key_insert_replaces() {
        let table = RoutingTable::new();
        table.add(backend("old", "app.localhost", "/api"));
        table.add(backend("new", "app.localhost", "/api"));

        let route = table.lookup("app.localhost", "/api/x").expect("route");
        assert_eq!(route.backend.container_id, "new");
        assert_eq!(table.len(), 1);

        table.add(backend("old-default", "app.localhost", ""));
        table.add(backend("new-default", "app.localhost", ""));
        let route = table.lookup("app.localhost", "/").expect("route");
        assert_eq!(route.backend.container_id, "new-default");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_by_container() {
        let table = RoutingTable::new();
        table.add(backend("abc123", "web.localhost", ""));
        table.add(backend("abc123", "web.localhost", "/api"));
        table.add(backend("other", "other.localhost", ""));

        table.remove_by_container("abc123");

        assert!(table.lookup("web.localhost", "/").is_none());
        assert!(table.lookup("web.localhost", "/api/x").is_none());
        assert!(table.lookup("other.localhost", "/").is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_by_project() {
        let table = RoutingTable::new();
        table.add(project_backend("a", "p1", "a.p1.localhost"));
        table.add(project_backend("b", "p1", "b.p1.localhost"));
        table.add(project_backend("c", "p2", "c.p2.localhost"));

        table.remove_by_project("p1");

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.iter().all(|entry| entry.project_name != "p1"));
    }

    #[test]
    fn test_replace_project_swaps_hostnames() {
        let table = RoutingTable::new();
        table.add(project_backend("web1", "p", "p.dev.localhost"));

        table.replace_project(
            "p",
            vec![
                project_backend("web1", "p", "web.p.dev.localhost"),
                project_backend("api1", "p", "api.p.dev.localhost"),
            ],
        );

        assert!(table.lookup("p.dev.localhost", "/").is_none());
        assert!(table.lookup("web.p.dev.localhost", "/").is_some());
        assert!(table.lookup("api.p.dev.localhost", "/").is_some());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let table = RoutingTable::new();
        table.add(backend("c", "c.localhost", ""));
        table.add(backend("a2", "a.localhost", "/api"));
        table.add(backend("a1", "a.localhost", ""));
        table.add(backend("b", "b.localhost", ""));

        let hostnames: Vec<(String, String)> = table
            .snapshot()
            .into_iter()
            .map(|entry| (entry.hostname, entry.path_prefix))
            .collect();

        assert_eq!(
            hostnames,
            vec![
                ("a.localhost".to_string(), String::new()),
                ("a.localhost".to_string(), "/api".to_string()),
                ("b.localhost".to_string(), String::new()),
                ("c.localhost".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_route_entry_describe() {
        let table = RoutingTable::new();
        table.add(backend("abc", "web.localhost", ""));
        let entry = &table.snapshot()[0];
        assert_eq!(
            entry.describe(),
            "https://web.localhost/ -> 172.18.0.2:80 (abc)"
        );
    }
}
