//! Hostname-prefix to upstream URL routing table
//!
//! The routing ConfigMap maps subdomain keys (the request host with its port
//! and the configured common suffix stripped) to upstream base URLs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::info;

/// Derive the routing key from a request `Host` value: drop the port, then
/// the common virtual-host suffix.
pub fn target_key(host: &str, common_suffix: &str) -> String {
    let hostname = host.split(':').next().unwrap_or(host);
    hostname
        .strip_suffix(common_suffix)
        .unwrap_or(hostname)
        .to_string()
}

/// Routing table fed from the HTTP targets ConfigMap
#[derive(Debug, Default)]
pub struct HttpRoutes {
    targets: Mutex<HashMap<String, String>>,
}

impl HttpRoutes {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream URL for a routing key, if one is configured
    pub fn target(&self, key: &str) -> Option<String> {
        self.targets.lock().unwrap().get(key).cloned()
    }

    /// Replace the table with the ConfigMap contents.
    ///
    /// Returns whether anything changed; the full table is logged only when
    /// it did.
    pub fn load(&self, data: BTreeMap<String, String>) -> bool {
        let incoming: HashMap<String, String> = data.into_iter().collect();

        let mut targets = self.targets.lock().unwrap();
        if *targets == incoming {
            return false;
        }

        info!(count = incoming.len(), "Loaded proxy config");
        if incoming.is_empty() {
            info!("No proxy targets");
        }
        for (key, upstream) in &incoming {
            info!(destination = %key, upstream = %upstream, "Route");
        }
        *targets = incoming;
        true
    }

    /// Drop every route (the backing ConfigMap was deleted)
    pub fn clear(&self) {
        let mut targets = self.targets.lock().unwrap();
        if !targets.is_empty() {
            targets.clear();
            info!("Deleted proxy target configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUFFIX: &str = ".localtest.me";

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn target_key_strips_port_and_suffix() {
        assert_eq!(target_key("app.localtest.me", SUFFIX), "app");
        assert_eq!(target_key("app.localtest.me:8080", SUFFIX), "app");
        assert_eq!(target_key("app.other.io", SUFFIX), "app.other.io");
        assert_eq!(target_key("app.other.io:443", SUFFIX), "app.other.io");
    }

    #[test]
    fn lookup_returns_the_configured_upstream() {
        let routes = HttpRoutes::new();
        routes.load(data(&[("app", "http://10.0.0.5:8000")]));

        assert_eq!(routes.target("app").as_deref(), Some("http://10.0.0.5:8000"));
        assert_eq!(routes.target("other"), None);
    }

    #[test]
    fn identical_payload_reports_no_change() {
        let routes = HttpRoutes::new();
        assert!(routes.load(data(&[("app", "http://10.0.0.5:8000")])));
        assert!(!routes.load(data(&[("app", "http://10.0.0.5:8000")])));
        assert!(routes.load(data(&[("app", "http://10.0.0.6:8000")])));
    }

    #[test]
    fn clear_drops_all_routes() {
        let routes = HttpRoutes::new();
        routes.load(data(&[("app", "http://10.0.0.5:8000")]));
        routes.clear();
        assert_eq!(routes.target("app"), None);
    }
}
