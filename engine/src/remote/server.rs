//! Server capability model

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proxy::ProxyKind;

/// Per-server settings that influence deployment output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Escape `$` inside generated container labels.
    #[serde(default)]
    pub escape_container_labels: bool,

    /// Attach the stack network alias to deployed services.
    #[serde(default)]
    pub use_network_aliases: bool,

    /// Reverse proxy flavor running on this server.
    #[serde(default)]
    pub proxy: ProxyKind,

    /// Docker network shared between the proxy and deployed stacks.
    #[serde(default = "default_proxy_network")]
    pub proxy_network: String,
}

fn default_proxy_network() -> String {
    "dockhand".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            escape_container_labels: false,
            use_network_aliases: false,
            proxy: ProxyKind::default(),
            proxy_network: default_proxy_network(),
        }
    }
}

/// A remote server the engine can run commands on.
///
/// The engine only reads the functional flag; how a server becomes
/// functional (provisioning, key installation, docker setup) is owned
/// elsewhere.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: Option<SecretString>,
    pub settings: ServerSettings,
    functional: bool,
}

impl Server {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            port: 22,
            user: "root".to_string(),
            private_key: None,
            settings: ServerSettings::default(),
            functional: true,
        }
    }

    /// Whether this server is reachable and usable for deployments.
    pub fn is_functional(&self) -> bool {
        self.functional
    }

    pub fn set_functional(&mut self, functional: bool) {
        self.functional = functional;
    }
}

/// In-memory inventory of known servers.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: std::sync::Mutex<Vec<Server>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id.
    pub fn upsert(&self, server: Server) {
        let mut servers = self.servers.lock().expect("poisoned lock");
        match servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Server> {
        self.servers
            .lock()
            .expect("poisoned lock")
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Server> {
        self.servers.lock().expect("poisoned lock").clone()
    }
}

/// Infrastructure-health signal for an application: true only when the
/// primary server AND every additional server report functional.
///
/// Container health never participates; this answers "is the
/// infrastructure up", not "is my app healthy".
pub fn server_status(primary: &Server, additional: &[&Server]) -> bool {
    primary.is_functional() && additional.iter().all(|s| s.is_functional())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_status_all_functional() {
        let primary = Server::new("primary", "10.0.0.1");
        let extra = Server::new("extra", "10.0.0.2");
        assert!(server_status(&primary, &[&extra]));
    }

    #[test]
    fn test_server_status_any_down() {
        let primary = Server::new("primary", "10.0.0.1");
        let mut extra = Server::new("extra", "10.0.0.2");
        extra.set_functional(false);
        assert!(!server_status(&primary, &[&extra]));

        let mut primary = primary;
        primary.set_functional(false);
        assert!(!server_status(&primary, &[]));
    }
}
