//! Engine configuration options

use std::time::Duration;

use crate::deploy::engine::DeployOptions;
use crate::jobs::{deployer, proxy_check};
use crate::proxy::ProxyOptions;

/// Main engine options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Enable the deploy worker
    pub enable_deployer: bool,

    /// Enable the periodic proxy check worker
    pub enable_proxy_check: bool,

    /// Deploy worker options
    pub deployer: deployer::Options,

    /// Proxy check worker options
    pub proxy_check: proxy_check::Options,

    /// Deployment pipeline options
    pub deploy: DeployOptions,

    /// Proxy reconciliation options
    pub proxy: ProxyOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            enable_deployer: true,
            enable_proxy_check: true,
            deployer: deployer::Options::default(),
            proxy_check: proxy_check::Options::default(),
            deploy: DeployOptions::default(),
            proxy: ProxyOptions::default(),
        }
    }
}

/// Lifecycle options for the engine process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
