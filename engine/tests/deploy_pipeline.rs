//! End-to-end deployment runs against a scripted executor

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use dockhand::deploy::engine::{CancellationFlag, DeployOptions, DeploymentEngine};
use dockhand::deploy::{BuildPack, DeploymentState, Source};
use dockhand::errors::EngineError;
use dockhand::events::{AlertSink, DeploymentEventKind, DeploymentEventRecord, EventPublisher};
use dockhand::models::{Application, Deployment, DeploymentStore, ServiceStore};
use dockhand::remote::{Server, ScriptedExecutor};

/// Publisher that records every event it sees.
#[derive(Default)]
struct RecordingPublisher {
    events: std::sync::Mutex<Vec<DeploymentEventKind>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: DeploymentEventRecord) -> Result<(), EngineError> {
        self.events.lock().unwrap().push(event.event);
        Ok(())
    }
}

impl RecordingPublisher {
    fn events(&self) -> Vec<DeploymentEventKind> {
        self.events.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct CountingAlertSink {
    alerts: AtomicUsize,
}

#[async_trait]
impl AlertSink for CountingAlertSink {
    async fn alert(&self, _message: &str) {
        self.alerts.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    executor: Arc<ScriptedExecutor>,
    publisher: Arc<RecordingPublisher>,
    alerts: Arc<CountingAlertSink>,
    store: Arc<DeploymentStore>,
    engine: DeploymentEngine,
}

fn harness() -> Harness {
    let executor = Arc::new(ScriptedExecutor::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let alerts = Arc::new(CountingAlertSink::default());
    let store = Arc::new(DeploymentStore::new());
    let engine = DeploymentEngine::new(
        executor.clone(),
        publisher.clone(),
        alerts.clone(),
        store.clone(),
        Arc::new(ServiceStore::new()),
        DeployOptions::default(),
    );
    Harness {
        executor,
        publisher,
        alerts,
        store,
        engine,
    }
}

#[tokio::test]
async fn test_image_deploy_finishes_and_stores_config_hash() {
    let h = harness();
    let mut app = Application::new("shop", BuildPack::DockerImage);
    app.docker_image = Some("acme/shop:1.4".to_string());
    app.domains = vec!["shop.example.com".to_string()];
    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Image {
        reference: "acme/shop:1.4".to_string(),
    };

    let outcome = h
        .engine
        .deploy(
            &mut app,
            &server,
            &source,
            &mut deployment,
            &CancellationFlag::new(),
        )
        .await;

    assert_eq!(outcome.state, DeploymentState::Finished);
    assert!(app.config_hash.is_some());
    assert_eq!(
        h.store.get(deployment.id).unwrap().status,
        DeploymentState::Finished
    );

    let commands = h.executor.commands();
    assert!(commands.iter().any(|c| c.starts_with("mkdir -p")));
    // The image pack materializes an empty env file next to the document.
    assert!(commands.iter().any(|c| c.contains("touch") && c.contains(".env")));
    let up = commands
        .iter()
        .position(|c| c.contains("docker compose") && c.contains("up -d"))
        .unwrap();
    let push = commands
        .iter()
        .position(|c| c.contains("docker-compose.yml") && c.contains("printf"))
        .unwrap();
    assert!(push < up, "document must be pushed before the stack starts");

    assert_eq!(
        h.publisher.events(),
        vec![DeploymentEventKind::Queued, DeploymentEventKind::Finished]
    );
    assert_eq!(h.alerts.alerts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_git_deploy_resolves_sha_and_tracks_restarts() {
    let h = harness();
    let sha = "196d3df7665359a8c8fa3329a6bcde0267e550bf";

    // In call order: ls-remote, mkdir, clone, cat Dockerfile, docker build,
    // push document, compose up, restart-count inspection.
    h.executor
        .push_success(&format!("{}\trefs/heads/main\n", sha));
    h.executor.push_success("");
    h.executor.push_success("");
    h.executor
        .push_success("FROM alpine\nHEALTHCHECK CMD curl -f http://localhost/\n");
    h.executor.push_success("");
    h.executor.push_success("");
    h.executor.push_success("");
    h.executor.push_success("2\n5\n0\n");

    let mut app = Application::new("shop", BuildPack::Dockerfile);
    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Git {
        repository: url::Url::parse("https://git.example.com/acme/shop.git").unwrap(),
        reference: "main".to_string(),
    };

    let outcome = h
        .engine
        .deploy(
            &mut app,
            &server,
            &source,
            &mut deployment,
            &CancellationFlag::new(),
        )
        .await;

    assert_eq!(outcome.state, DeploymentState::Finished);
    assert_eq!(outcome.commit_sha.as_deref(), Some(sha));
    assert_eq!(outcome.restart_count, 5);
    assert!(app.custom_healthcheck_found);
    assert_eq!(h.store.get(deployment.id).unwrap().restart_count, 5);

    let commands = h.executor.commands();
    assert!(commands[0].starts_with("git ls-remote"));
    assert!(commands.iter().any(|c| c.contains("git clone")));
    assert!(commands.iter().any(|c| c.contains("docker build")));
}

#[tokio::test]
async fn test_removed_healthcheck_directive_resets_the_flag() {
    let h = harness();
    let sha = "cafe3df7665359a8c8fa3329a6bcde0267e550bf";
    h.executor
        .push_success(&format!("{}\trefs/heads/main\n", sha));
    h.executor.push_success("");
    h.executor.push_success("");
    // The Dockerfile no longer carries a HEALTHCHECK directive.
    h.executor.push_success("FROM alpine\nRUN true\n");

    let mut app = Application::new("shop", BuildPack::Dockerfile);
    app.custom_healthcheck_found = true;
    // The reset happens even while healthchecks are not gating deployments.
    app.settings.healthchecks_enabled = false;

    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Git {
        repository: url::Url::parse("https://git.example.com/acme/shop.git").unwrap(),
        reference: "main".to_string(),
    };

    let outcome = h
        .engine
        .deploy(
            &mut app,
            &server,
            &source,
            &mut deployment,
            &CancellationFlag::new(),
        )
        .await;

    assert_eq!(outcome.state, DeploymentState::Finished);
    assert!(!app.custom_healthcheck_found);
}

#[tokio::test]
async fn test_failed_resolution_marks_failed_without_alert() {
    let h = harness();
    h.executor
        .push_output(128, "", "fatal: repository not found");

    let mut app = Application::new("shop", BuildPack::Dockerfile);
    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Git {
        repository: url::Url::parse("https://git.example.com/acme/missing.git").unwrap(),
        reference: "main".to_string(),
    };

    let outcome = h
        .engine
        .deploy(
            &mut app,
            &server,
            &source,
            &mut deployment,
            &CancellationFlag::new(),
        )
        .await;

    assert_eq!(outcome.state, DeploymentState::Failed);
    assert!(app.config_hash.is_none());

    let stored = h.store.get(deployment.id).unwrap();
    assert_eq!(stored.status, DeploymentState::Failed);
    assert!(stored.error_message.unwrap().contains("repository not found"));

    // A resolution failure is an expected domain error; no operator alert.
    assert_eq!(h.alerts.alerts.load(Ordering::SeqCst), 0);
    assert!(matches!(
        h.publisher.events().last(),
        Some(DeploymentEventKind::Failed { .. })
    ));
}

#[tokio::test]
async fn test_unexpected_error_escalates_to_the_alert_sink() {
    let h = harness();
    let mut app = Application::new("shop", BuildPack::DockerCompose);
    // Unparseable user document: generation dies with an internal error
    // rather than a domain one.
    app.compose_raw = Some("services: [broken".to_string());
    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Image {
        reference: "unused".to_string(),
    };

    let outcome = h
        .engine
        .deploy(
            &mut app,
            &server,
            &source,
            &mut deployment,
            &CancellationFlag::new(),
        )
        .await;

    assert_eq!(outcome.state, DeploymentState::Failed);
    assert_eq!(
        h.store.get(deployment.id).unwrap().status,
        DeploymentState::Failed
    );
    assert!(matches!(
        h.publisher.events().last(),
        Some(DeploymentEventKind::Failed { .. })
    ));
    // Unlike a domain failure, a parse blow-up pages the operator.
    assert_eq!(h.alerts.alerts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_cleans_up() {
    let h = harness();
    let mut app = Application::new("shop", BuildPack::DockerImage);
    app.docker_image = Some("acme/shop:1.4".to_string());
    let server = Server::new("srv-1", "10.0.0.5");
    let mut deployment = Deployment::new(app.id, server.id);
    let source = Source::Image {
        reference: "acme/shop:1.4".to_string(),
    };

    let cancel = CancellationFlag::new();
    cancel.cancel();

    let outcome = h
        .engine
        .deploy(&mut app, &server, &source, &mut deployment, &cancel)
        .await;

    assert_eq!(outcome.state, DeploymentState::Cancelled);
    assert_eq!(
        h.store.get(deployment.id).unwrap().status,
        DeploymentState::Cancelled
    );
    assert!(h
        .executor
        .commands()
        .iter()
        .any(|c| c.starts_with("rm -rf")));
    assert_eq!(
        h.publisher.events(),
        vec![DeploymentEventKind::Queued, DeploymentEventKind::Cancelled]
    );
}
