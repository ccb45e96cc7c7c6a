// Routing metadata updated by the last pipeline stage.
//
// The reverse proxy itself lives outside this crate; it reads the table
// through the API and routes requests by Host header.

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

/// Backend target for a routed domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub service_id: String,
    /// Deployment that published this backend
    pub deployment_id: String,
    pub host: String,
    pub port: u16,
}

impl Backend {
    /// Get the backend address as a URI authority
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Thread-safe route table for mapping domains to backends
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, Backend>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Add or update a route for a domain
    pub fn add_route(&self, domain: String, backend: Backend) {
        info!(domain = %domain, backend = %backend.addr(), "Adding route");
        self.routes.insert(domain.to_lowercase(), backend);
    }

    /// Remove every route pointing at a service
    pub fn remove_service(&self, service_id: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, b| b.service_id != service_id);
        let removed = before - self.routes.len();
        if removed > 0 {
            info!(service_id = %service_id, removed, "Removed routes for service");
        }
        removed
    }

    /// Get the backend for a domain
    pub fn get_backend(&self, domain: &str) -> Option<Backend> {
        let domain = domain.to_lowercase();
        if let Some(backend) = self.routes.get(&domain) {
            return Some(backend.clone());
        }

        // Try stripping port from domain (e.g., "example.com:8080" -> "example.com")
        let host = domain.split(':').next()?;
        self.routes.get(host).map(|b| b.clone())
    }

    /// Snapshot of all routes, sorted by domain
    pub fn all(&self) -> Vec<(String, Backend)> {
        let mut routes: Vec<(String, Backend)> = self
            .routes
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(service: &str, port: u16) -> Backend {
        Backend {
            service_id: service.to_string(),
            deployment_id: "d1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_lookup_ignores_case_and_port() {
        let table = RouteTable::new();
        table.add_route("App.Example.com".to_string(), backend("s1", 49000));
        assert_eq!(table.get_backend("app.example.com").unwrap().port, 49000);
        assert_eq!(table.get_backend("app.example.com:443").unwrap().port, 49000);
        assert!(table.get_backend("other.example.com").is_none());
    }

    #[test]
    fn test_new_deployment_replaces_backend() {
        let table = RouteTable::new();
        table.add_route("a.test".to_string(), backend("s1", 1000));
        table.add_route("a.test".to_string(), backend("s1", 2000));
        assert_eq!(table.all().len(), 1);
        assert_eq!(table.get_backend("a.test").unwrap().addr(), "127.0.0.1:2000");
    }

    #[test]
    fn test_remove_service_routes() {
        let table = RouteTable::new();
        table.add_route("a.test".to_string(), backend("s1", 1000));
        table.add_route("b.test".to_string(), backend("s2", 1001));
        assert_eq!(table.remove_service("s1"), 1);
        let domains: Vec<String> = table.all().into_iter().map(|(d, _)| d).collect();
        assert_eq!(domains, vec!["b.test".to_string()]);
    }
}
