//! Periodic proxy version check worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::proxy::ProxyReconciler;
use crate::remote::server::ServerRegistry;

/// Proxy check worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between fleet checks
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
        }
    }
}

/// Run the proxy check worker
///
/// Each tick fans the check out across the fleet, one detached task per
/// server; the worker never waits for individual servers and a hung check
/// cannot delay the next tick.
pub async fn run<S, F>(
    options: &Options,
    reconciler: Arc<ProxyReconciler>,
    servers: Arc<ServerRegistry>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Proxy check worker starting...");

    loop {
        // Check for shutdown
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Proxy check worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with check
            }
        }

        let fleet = servers.list();
        debug!("Checking proxy on {} servers...", fleet.len());
        reconciler.check_fleet(fleet);
    }
}
