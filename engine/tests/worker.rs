//! Deploy worker loop under a scripted executor

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_test::assert_ok;

use dockhand::deploy::engine::{CancellationFlag, DeployOptions, DeploymentEngine};
use dockhand::deploy::{BuildPack, DeploymentState, Source};
use dockhand::events::{LogAlertSink, LogPublisher};
use dockhand::jobs::deployer::{self, DeployQueue, DeployTask};
use dockhand::jobs::OverlapLockRegistry;
use dockhand::models::{Application, Deployment, DeploymentStore, ServiceStore};
use dockhand::remote::{ScriptedExecutor, Server};

#[tokio::test]
async fn test_worker_processes_queued_task_and_shuts_down() {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = Arc::new(DeploymentStore::new());
    let engine = Arc::new(DeploymentEngine::new(
        executor.clone(),
        Arc::new(LogPublisher),
        Arc::new(LogAlertSink),
        store.clone(),
        Arc::new(ServiceStore::new()),
        DeployOptions::default(),
    ));

    let queue = DeployQueue::new();
    let mut application = Application::new("shop", BuildPack::DockerImage);
    application.docker_image = Some("acme/shop:1.4".to_string());
    let server = Server::new("srv-1", "10.0.0.5");
    let deployment = Deployment::new(application.id, server.id);
    let deployment_id = deployment.id;
    queue.push(DeployTask {
        source: Source::Image {
            reference: "acme/shop:1.4".to_string(),
        },
        application,
        server,
        deployment,
        cancel: CancellationFlag::new(),
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let worker_queue = queue.clone();
    let status_view = store.clone();
    let handle = tokio::spawn(async move {
        deployer::run(
            &deployer::Options {
                interval: Duration::from_millis(1),
            },
            worker_queue,
            engine,
            store.clone(),
            OverlapLockRegistry::new(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;

        store
    });

    // Wait for the worker to finish the queued deployment.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if status_view
            .get(deployment_id)
            .is_some_and(|d| d.status.is_terminal())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let _ = shutdown_tx.send(());
    let store = assert_ok!(
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
    );

    assert_eq!(
        store.get(deployment_id).unwrap().status,
        DeploymentState::Finished
    );
}
