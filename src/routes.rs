//! Route table served by the proxy
//!
//! The table is an immutable snapshot published through an [`ArcSwap`]. The scheduler builds a new snapshot whenever
//! a service's route is activated or deactivated and stores it; the proxy loads exactly one snapshot per request, so
//! a request never observes a half-applied change.

use crate::registry::{normalize_prefix, Endpoint, Registry};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to the current route snapshot.
pub type SharedRouteTable = Arc<ArcSwap<RouteTable>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: String,
    pub service: String,
    pub upstream: Endpoint,
    pub strip_prefix: bool,
    /// True only while the service's instance is healthy.
    pub active: bool,
}

impl RouteEntry {
    /// Whether `path` falls under this route's prefix on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.prefix, path)
    }

    /// Path and query to send upstream for a request to `path_and_query`.
    pub fn upstream_path(&self, path_and_query: &str) -> String {
        if !self.strip_prefix {
            return path_and_query.to_string();
        }

        let rest = &path_and_query[normalize_prefix(&self.prefix).len().min(path_and_query.len())..];
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }
}

/// Immutable set of routes, sorted longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    generation: u64,
}

impl RouteTable {
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        entries.sort_by(|a, b| {
            normalize_prefix(&b.prefix)
                .len()
                .cmp(&normalize_prefix(&a.prefix).len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { entries, generation: 0 }
    }

    /// One inactive route per service that declares a prefix.
    pub fn from_registry(registry: &Registry) -> Self {
        let entries = registry
            .specs()
            .iter()
            .filter_map(|spec| {
                let route = spec.route.as_ref()?;
                let upstream = spec.endpoint.clone()?;
                Some(RouteEntry {
                    prefix: route.prefix.clone(),
                    service: spec.name.clone(),
                    upstream,
                    strip_prefix: route.strip_prefix,
                    active: false,
                })
            })
            .collect();
        Self::new(entries)
    }

    /// Shares the table behind an [`ArcSwap`].
    pub fn into_shared(self) -> SharedRouteTable {
        Arc::new(ArcSwap::from_pointee(self))
    }

    /// The route with the longest prefix matching `path`, active or not.
    pub fn lookup(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.matches(path))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Incremented on every published change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    /// A copy with the service's routes set to `active`, or `None` if nothing would change.
    pub fn with_service_active(&self, service: &str, active: bool) -> Option<RouteTable> {
        if !self
            .entries
            .iter()
            .any(|e| e.service == service && e.active != active)
        {
            return None;
        }

        let entries = self
            .entries
            .iter()
            .map(|e| {
                let mut e = e.clone();
                if e.service == service {
                    e.active = active;
                }
                e
            })
            .collect();
        Some(RouteTable {
            entries,
            generation: self.generation + 1,
        })
    }
}

/// Activate or deactivate a service's routes, publishing a new snapshot if anything changed.
///
/// Returns whether a new snapshot was stored.
pub fn set_service_active(table: &SharedRouteTable, service: &str, active: bool) -> bool {
    let mut changed = false;
    table.rcu(|current| match current.with_service_active(service, active) {
        Some(next) => {
            changed = true;
            Arc::new(next)
        }
        None => {
            changed = false;
            Arc::clone(current)
        }
    });
    changed
}

/// Segment-boundary prefix match: `/api` matches `/api` and `/api/x` but not `/apix`; `/` matches everything.
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = normalize_prefix(prefix);
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prefix: &str, service: &str, port: u16) -> RouteEntry {
        RouteEntry {
            prefix: prefix.to_string(),
            service: service.to_string(),
            upstream: Endpoint::new("127.0.0.1", port),
            strip_prefix: false,
            active: true,
        }
    }

    #[test]
    fn test_prefix_matches_segments() {
        assert!(prefix_matches("/api", "/api"));
        assert!(prefix_matches("/api", "/api/users"));
        assert!(prefix_matches("/api/", "/api/users"));
        assert!(prefix_matches("/api", "/api?x=1"));
        assert!(!prefix_matches("/api", "/apix"));
        assert!(!prefix_matches("/api", "/"));
        assert!(prefix_matches("/", "/anything/at/all"));
        assert!(prefix_matches("/", "/"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new(vec![
            entry("/", "frontend", 5173),
            entry("/api", "api", 3000),
            entry("/api/admin", "admin", 3001),
        ]);

        assert_eq!(table.lookup("/api/admin/users").unwrap().service, "admin");
        assert_eq!(table.lookup("/api/users").unwrap().service, "api");
        assert_eq!(table.lookup("/apiary").unwrap().service, "frontend");
        assert_eq!(table.lookup("/").unwrap().service, "frontend");
    }

    #[test]
    fn test_no_match_without_root_route() {
        let table = RouteTable::new(vec![entry("/api", "api", 3000)]);
        assert!(table.lookup("/static/app.js").is_none());
    }

    #[test]
    fn test_upstream_path_strip() {
        let mut e = entry("/api", "api", 3000);
        assert_eq!(e.upstream_path("/api/users?page=2"), "/api/users?page=2");

        e.strip_prefix = true;
        assert_eq!(e.upstream_path("/api/users?page=2"), "/users?page=2");
        assert_eq!(e.upstream_path("/api"), "/");
        assert_eq!(e.upstream_path("/api?x=1"), "/?x=1");

        let root = RouteEntry {
            strip_prefix: true,
            ..entry("/", "web", 80)
        };
        assert_eq!(root.upstream_path("/index.html"), "/index.html");
    }

    #[test]
    fn test_with_service_active() {
        let mut inactive = entry("/api", "api", 3000);
        inactive.active = false;
        let table = RouteTable::new(vec![inactive, entry("/", "web", 80)]);
        assert_eq!(table.active_count(), 1);

        let next = table.with_service_active("api", true).unwrap();
        assert_eq!(next.generation(), table.generation() + 1);
        assert_eq!(next.active_count(), 2);
        assert!(next.with_service_active("api", true).is_none());
        assert!(next.with_service_active("unknown", false).is_none());
    }

    #[test]
    fn test_set_service_active_publishes_snapshot() {
        let mut inactive = entry("/api", "api", 3000);
        inactive.active = false;
        let shared = RouteTable::new(vec![inactive]).into_shared();

        let before = shared.load_full();
        assert!(set_service_active(&shared, "api", true));
        assert!(!set_service_active(&shared, "api", true));

        // A snapshot held across the swap is unchanged
        assert!(!before.entries()[0].active);
        assert!(shared.load().entries()[0].active);
        assert_eq!(shared.load().generation(), 1);
    }

    #[test]
    fn test_readers_see_whole_snapshots() {
        let entries: Vec<RouteEntry> = (0..8)
            .map(|i| entry(&format!("/svc{}", i), &format!("svc{}", i), 1000))
            .collect();
        let shared = RouteTable::new(entries).into_shared();

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for round in 1..=500u16 {
                    let current = shared.load_full();
                    let entries = current
                        .entries()
                        .iter()
                        .map(|e| RouteEntry {
                            upstream: Endpoint::new("127.0.0.1", 1000 + round),
                            ..e.clone()
                        })
                        .collect();
                    shared.store(Arc::new(RouteTable::new(entries)));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let snapshot = shared.load();
                        let port = snapshot.entries()[0].upstream.port;
                        assert!(snapshot.entries().iter().all(|e| e.upstream.port == port));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_from_registry() {
        use crate::config::ServiceConfig;
        use std::collections::BTreeMap;

        let registry = Registry::load(
            &[
                ServiceConfig::new("db", &["postgres"]).with_port(5432),
                ServiceConfig::new("api", &["api"]).with_port(3000).with_route("/api"),
                ServiceConfig::new("web", &["vite"]).with_port(5173).with_route("/"),
            ],
            &crate::config::ServiceDefaults::default(),
            &BTreeMap::new(),
            std::path::Path::new("."),
        )
        .unwrap();

        let table = RouteTable::from_registry(&registry);
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.entries()[0].prefix, "/api");
        assert_eq!(table.lookup("/api/v1").unwrap().upstream, Endpoint::new("127.0.0.1", 3000));
    }
}
