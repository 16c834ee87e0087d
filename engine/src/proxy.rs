//! Reverse-proxy reconciliation
//!
//! Keeps the proxy container on each server at the expected image and
//! restarts it without racing Docker's asynchronous container removal:
//! stop, force-remove, then wait until the name is gone from the listing
//! before starting again.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::remote::executor::{poll_until, RemoteExecutor};
use crate::remote::server::Server;
use crate::shell::{escape_shell_argument, validate_shell_safe_path};

/// Reverse proxy flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Traefik,
    Caddy,
}

impl ProxyKind {
    pub fn image(&self) -> &'static str {
        match self {
            ProxyKind::Traefik => "traefik:v3.1",
            ProxyKind::Caddy => "lucaslorentz/caddy-docker-proxy:2.8",
        }
    }
}

/// A dynamic-configuration artifact pushed to a server's proxy directory.
///
/// The filename is the only untrusted input at this boundary; it must pass
/// shell-safety validation before any path interpolation. The extension is
/// the caller's concern (`.yaml`/`.yml` for Traefik-family config, Caddy
/// uses its own format) and is deliberately not whitelisted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfigFile {
    pub name: String,
    pub content: String,
}

impl ProxyConfigFile {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_shell_safe_path(&self.name, "proxy config filename")
    }
}

/// Options for proxy reconciliation.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Name of the proxy container on each server.
    pub container_name: String,

    /// Seconds handed to `docker stop -t`.
    pub stop_timeout_secs: u32,

    /// Attempts to wait for the old container to disappear.
    pub removal_attempts: u32,

    /// Sleep between removal checks.
    pub removal_interval: Duration,

    /// Directory holding dynamic configuration files.
    pub dynamic_config_dir: String,

    /// Timeout for individual remote commands.
    pub command_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            container_name: "dockhand-proxy".to_string(),
            stop_timeout_secs: 30,
            removal_attempts: 10,
            removal_interval: Duration::from_secs(1),
            dynamic_config_dir: "/data/dockhand/proxy/dynamic".to_string(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Ensures the proxy container on a server runs the expected version and
/// configuration.
pub struct ProxyReconciler {
    executor: Arc<dyn RemoteExecutor>,
    options: ProxyOptions,
}

impl ProxyReconciler {
    pub fn new(executor: Arc<dyn RemoteExecutor>, options: ProxyOptions) -> Self {
        Self { executor, options }
    }

    /// Restart the proxy container. Strictly ordered: stop with a bounded
    /// timeout and error suppression, force-remove with error suppression,
    /// wait until the name no longer appears in `docker ps -a`, then start.
    pub async fn restart(&self, server: &Server) -> Result<(), EngineError> {
        let name = &self.options.container_name;
        let timeout = self.options.command_timeout;
        info!("Restarting proxy on {}", server.name);

        let stop = format!(
            "docker stop -t {} {} || true",
            self.options.stop_timeout_secs,
            escape_shell_argument(name)
        );
        self.executor.run(server, &stop, timeout).await?;

        let remove = format!("docker rm -f {} || true", escape_shell_argument(name));
        self.executor.run(server, &remove, timeout).await?;

        let gone = poll_until(
            self.options.removal_attempts,
            self.options.removal_interval,
            || async {
                let listing = self
                    .executor
                    .run(server, "docker ps -a --format '{{.Names}}'", timeout)
                    .await;
                match listing {
                    Ok(output) => !output.stdout.lines().any(|line| line.trim() == name),
                    Err(e) => {
                        warn!("Failed to list containers on {}: {}", server.name, e);
                        false
                    }
                }
            },
        )
        .await;
        if !gone {
            return Err(EngineError::Proxy(format!(
                "container {} still present on {} after removal",
                name, server.name
            )));
        }

        self.start(server).await
    }

    async fn start(&self, server: &Server) -> Result<(), EngineError> {
        let proxy = server.settings.proxy;
        let start = format!(
            "docker run -d --name {name} --restart unless-stopped \
             --network {network} \
             -p 80:80 -p 443:443 \
             -v /var/run/docker.sock:/var/run/docker.sock:ro \
             -v {config_dir}:/dynamic \
             {image}",
            name = escape_shell_argument(&self.options.container_name),
            network = escape_shell_argument(&server.settings.proxy_network),
            config_dir = escape_shell_argument(&self.options.dynamic_config_dir),
            image = proxy.image(),
        );
        self.executor
            .run(server, &start, self.options.command_timeout)
            .await?
            .into_result()?;

        info!("Proxy started on {}", server.name);
        Ok(())
    }

    /// The image the proxy container currently runs, or None when the
    /// container does not exist.
    async fn current_image(&self, server: &Server) -> Result<Option<String>, EngineError> {
        let inspect = format!(
            "docker inspect --format '{{{{.Config.Image}}}}' {}",
            escape_shell_argument(&self.options.container_name)
        );
        let output = self
            .executor
            .run(server, &inspect, self.options.command_timeout)
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout.trim().to_string()))
    }

    /// Restart the proxy when it is missing or running an unexpected image.
    pub async fn ensure_current(&self, server: &Server) -> Result<(), EngineError> {
        let expected = server.settings.proxy.image();
        match self.current_image(server).await? {
            Some(image) if image == expected => {
                debug!("Proxy on {} already at {}", server.name, expected);
                Ok(())
            }
            Some(image) => {
                info!(
                    "Proxy on {} runs {}, expected {}; restarting",
                    server.name, image, expected
                );
                self.restart(server).await
            }
            None => {
                info!("Proxy missing on {}; starting", server.name);
                self.restart(server).await
            }
        }
    }

    /// Push a dynamic configuration file to the server's proxy directory.
    /// The filename is validated before any path interpolation.
    pub async fn push_dynamic_config(
        &self,
        server: &Server,
        file: &ProxyConfigFile,
    ) -> Result<(), EngineError> {
        file.validate()?;

        let path = format!("{}/{}", self.options.dynamic_config_dir, file.name);
        let write = format!(
            "mkdir -p {dir} && printf '%s' {content} > {path}",
            dir = escape_shell_argument(&self.options.dynamic_config_dir),
            content = escape_shell_argument(&file.content),
            path = escape_shell_argument(&path),
        );
        self.executor
            .run(server, &write, self.options.command_timeout)
            .await?
            .into_result()?;

        debug!("Pushed proxy config {} to {}", file.name, server.name);
        Ok(())
    }

    /// Check every server's proxy version, one fire-and-forget task per
    /// server, so a slow or failing check never blocks the others.
    pub fn check_fleet(self: &Arc<Self>, servers: Vec<Server>) {
        for server in servers {
            let reconciler = Arc::clone(self);
            tokio::spawn(async move {
                if !server.is_functional() {
                    debug!("Skipping proxy check on non-functional {}", server.name);
                    return;
                }
                if let Err(e) = reconciler.ensure_current(&server).await {
                    warn!("Proxy check failed on {}: {}", server.name, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::executor::ScriptedExecutor;

    fn reconciler(executor: Arc<ScriptedExecutor>) -> ProxyReconciler {
        let options = ProxyOptions {
            removal_attempts: 3,
            removal_interval: Duration::from_millis(1),
            ..ProxyOptions::default()
        };
        ProxyReconciler::new(executor, options)
    }

    #[tokio::test]
    async fn test_restart_orders_stop_remove_wait_start() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.push_success(""); // stop
        executor.push_success(""); // rm
        executor.push_success("dockhand-proxy\nother\n"); // still listed
        executor.push_success("other\n"); // gone
        executor.push_success(""); // docker run

        let server = Server::new("srv", "10.0.0.1");
        reconciler(Arc::clone(&executor))
            .restart(&server)
            .await
            .unwrap();

        let commands = executor.commands();
        assert!(commands[0].starts_with("docker stop -t 30"));
        assert!(commands[0].ends_with("|| true"));
        assert!(commands[1].starts_with("docker rm -f"));
        assert!(commands[2].contains("docker ps -a"));
        assert!(commands[3].contains("docker ps -a"));
        assert!(commands[4].starts_with("docker run -d"));
    }

    #[tokio::test]
    async fn test_restart_fails_when_container_never_disappears() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.push_success(""); // stop
        executor.push_success(""); // rm
        for _ in 0..3 {
            executor.push_success("dockhand-proxy\n");
        }

        let server = Server::new("srv", "10.0.0.1");
        let result = reconciler(executor).restart(&server).await;
        assert!(matches!(result, Err(EngineError::Proxy(_))));
    }

    #[tokio::test]
    async fn test_push_dynamic_config_validates_filename() {
        let executor = Arc::new(ScriptedExecutor::new());
        let reconciler = reconciler(Arc::clone(&executor));
        let server = Server::new("srv", "10.0.0.1");

        let bad = ProxyConfigFile {
            name: "route$(whoami).yaml".to_string(),
            content: "http: {}".to_string(),
        };
        assert!(reconciler.push_dynamic_config(&server, &bad).await.is_err());
        // Rejected before any command was issued.
        assert!(executor.commands().is_empty());

        let good = ProxyConfigFile {
            name: "app-route.yaml".to_string(),
            content: "http: {}".to_string(),
        };
        reconciler.push_dynamic_config(&server, &good).await.unwrap();
        assert_eq!(executor.commands().len(), 1);
    }
}
