//! Main engine run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::deploy::engine::DeploymentEngine;
use crate::errors::EngineError;
use crate::events::{AlertSink, EventPublisher, LogAlertSink, LogPublisher};
use crate::jobs::lock::OverlapLockRegistry;
use crate::jobs::{deployer, proxy_check, DeployQueue};
use crate::models::deployment::DeploymentStore;
use crate::models::service::ServiceStore;
use crate::proxy::ProxyReconciler;
use crate::remote::executor::{RemoteExecutor, SshExecutor};
use crate::remote::server::ServerRegistry;

/// Shared state wired into every worker.
pub struct AppState {
    pub executor: Arc<dyn RemoteExecutor>,
    pub events: Arc<dyn EventPublisher>,
    pub alerts: Arc<dyn AlertSink>,
    pub store: Arc<DeploymentStore>,
    pub services: Arc<ServiceStore>,
    pub servers: Arc<ServerRegistry>,
    pub queue: DeployQueue,
    pub locks: OverlapLockRegistry,
    pub engine: Arc<DeploymentEngine>,
    pub reconciler: Arc<ProxyReconciler>,
}

impl AppState {
    pub fn init(options: &AppOptions) -> Arc<Self> {
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::default());
        Self::init_with_executor(options, executor)
    }

    pub fn init_with_executor(
        options: &AppOptions,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Arc<Self> {
        let events: Arc<dyn EventPublisher> = Arc::new(LogPublisher);
        let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
        let store = Arc::new(DeploymentStore::new());
        let services = Arc::new(ServiceStore::new());

        let engine = Arc::new(DeploymentEngine::new(
            Arc::clone(&executor),
            Arc::clone(&events),
            Arc::clone(&alerts),
            Arc::clone(&store),
            Arc::clone(&services),
            options.deploy.clone(),
        ));
        let reconciler = Arc::new(ProxyReconciler::new(
            Arc::clone(&executor),
            options.proxy.clone(),
        ));

        Arc::new(Self {
            executor,
            events,
            alerts,
            store,
            services,
            servers: Arc::new(ServerRegistry::new()),
            queue: DeployQueue::new(),
            locks: OverlapLockRegistry::new(),
            engine,
            reconciler,
        })
    }
}

/// Run the engine until the shutdown signal resolves.
pub async fn run(
    options: AppOptions,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing engine...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if options.enable_deployer {
        init_deployer_worker(&options, state.clone(), &mut shutdown_manager, shutdown_tx.subscribe())?;
    }

    if options.enable_proxy_check {
        init_proxy_check_worker(&options, state.clone(), &mut shutdown_manager, shutdown_tx.subscribe())?;
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
        }
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

fn init_deployer_worker(
    options: &AppOptions,
    state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing deploy worker...");

    let worker_options = options.deployer.clone();
    let queue = state.queue.clone();
    let engine = Arc::clone(&state.engine);
    let store = Arc::clone(&state.store);
    let locks = state.locks.clone();

    let handle = tokio::spawn(async move {
        deployer::run(
            &worker_options,
            queue,
            engine,
            store,
            locks,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(handle)
}

fn init_proxy_check_worker(
    options: &AppOptions,
    state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing proxy check worker...");

    let worker_options = options.proxy_check.clone();
    let reconciler = Arc::clone(&state.reconciler);
    let servers = Arc::clone(&state.servers);

    let handle = tokio::spawn(async move {
        proxy_check::run(
            &worker_options,
            reconciler,
            servers,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_proxy_check_worker_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    deployer_worker_handle: Option<JoinHandle<()>>,
    proxy_check_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            deployer_worker_handle: None,
            proxy_check_worker_handle: None,
        }
    }

    fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), EngineError> {
        if self.deployer_worker_handle.is_some() {
            return Err(EngineError::Internal("deployer handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    fn with_proxy_check_worker_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), EngineError> {
        if self.proxy_check_worker_handle.is_some() {
            return Err(EngineError::Internal("proxy check handle already set".to_string()));
        }
        self.proxy_check_worker_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down engine...");

        // 1. Deploy worker
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }

        // 2. Proxy check worker
        if let Some(handle) = self.proxy_check_worker_handle.take() {
            handle
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
