//! Deployment engine
//!
//! Drives one deployment through the state machine: resolve the source,
//! fetch it onto the server, generate the compose document for the build
//! pack, inject labels, push the document, bring the stack up and watch
//! container health. Every remote interaction goes through the injected
//! [`RemoteExecutor`]; events and alerts go through their own seams so the
//! engine never blocks on a slow publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::compose::document::DeployTimeComposeDocument;
use crate::compose::labels::{inject, InjectionMetadata};
use crate::compose::parse::{parse, ServiceGraph};
use crate::deploy::buildpack::{BuildContext, BuildPack, GeneratorFactory};
use crate::deploy::source::{ResolvedSource, Source};
use crate::deploy::state::{DeploymentEvent, DeploymentState, DeploymentStateMachine};
use crate::errors::EngineError;
use crate::events::{AlertSink, DeploymentEventKind, DeploymentEventRecord, EventPublisher};
use crate::models::application::Application;
use crate::models::deployment::{Deployment, DeploymentStore};
use crate::models::service::ServiceStore;
use crate::remote::executor::RemoteExecutor;
use crate::remote::server::Server;
use crate::shell::{escape_shell_argument, is_safe_tmp_path};

/// Compute the configuration-change hash over every user-tunable setting.
///
/// SHA-256 over `name=value` lines in the fixed field order, hex encoded.
pub fn configuration_hash(application: &Application) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in application.settings.hash_fields() {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Whether the configuration changed since the last stored deployment.
/// A missing stored hash always counts as changed.
pub fn needs_new_release(application: &Application, current_hash: &str) -> bool {
    match &application.config_hash {
        Some(stored) => stored != current_hash,
        None => true,
    }
}

/// Detect a HEALTHCHECK directive in Dockerfile text. Comment lines never
/// count; the directive is case-insensitive per the Dockerfile grammar.
pub fn dockerfile_has_healthcheck(dockerfile: &str) -> bool {
    dockerfile.lines().any(|line| {
        let trimmed = line.trim_start();
        !trimmed.starts_with('#') && trimmed.to_ascii_uppercase().starts_with("HEALTHCHECK")
    })
}

/// Aggregate per-container restart counts (one integer per line, as
/// produced by `docker inspect --format '{{.RestartCount}}'`) to the
/// stack-wide maximum. Unparseable lines are skipped; no containers means
/// zero.
pub fn max_restart_count(inspect_output: &str) -> u32 {
    inspect_output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

/// Tunables for a deployment run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Base directory for per-deployment working directories.
    pub workdir_base: String,

    /// Timeout for individual remote commands.
    pub command_timeout: Duration,

    /// Timeout for the source fetch (clones can be slow).
    pub fetch_timeout: Duration,

    /// Health polling attempts after the stack comes up.
    pub health_attempts: u32,

    /// Sleep between health polls.
    pub health_interval: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            workdir_base: "/tmp/dockhand".to_string(),
            command_timeout: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(600),
            health_attempts: 30,
            health_interval: Duration::from_secs(2),
        }
    }
}

/// Final result of a deployment run, successful or not.
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub state: DeploymentState,
    pub commit_sha: Option<String>,
    pub config_hash: String,
    pub restart_count: u32,
}

/// Cooperative cancellation flag checked between pipeline phases.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the forward path stopped.
enum Interrupt {
    Cancelled,
    Failed(EngineError),
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Failed(err)
    }
}

pub struct DeploymentEngine {
    executor: Arc<dyn RemoteExecutor>,
    events: Arc<dyn EventPublisher>,
    alerts: Arc<dyn AlertSink>,
    store: Arc<DeploymentStore>,
    services: Arc<ServiceStore>,
    options: DeployOptions,
}

impl DeploymentEngine {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        events: Arc<dyn EventPublisher>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<DeploymentStore>,
        services: Arc<ServiceStore>,
        options: DeployOptions,
    ) -> Self {
        Self {
            executor,
            events,
            alerts,
            store,
            services,
            options,
        }
    }

    /// Run one deployment end to end.
    ///
    /// The returned outcome always carries a terminal state; errors along
    /// the pipeline are folded into the record and the event stream rather
    /// than bubbling to the caller, so a worker can treat any `Ok` as
    /// "the run completed and its record is current". Only event/alert
    /// plumbing is infallible by policy: a publish failure is logged and
    /// never overrides the deployment's own outcome.
    pub async fn deploy(
        &self,
        application: &mut Application,
        server: &Server,
        source: &Source,
        deployment: &mut Deployment,
        cancel: &CancellationFlag,
    ) -> DeploymentOutcome {
        let config_hash = configuration_hash(application);
        let mut fsm = DeploymentStateMachine::new();

        deployment.mark_started();
        self.store.save(deployment);
        self.publish(deployment, DeploymentEventKind::Queued).await;

        let result = self
            .run_pipeline(application, server, source, deployment, cancel, &mut fsm)
            .await;

        let workdir = self.workdir(deployment);
        match result {
            Ok(()) => {
                application.config_hash = Some(config_hash.clone());
                self.finalize(deployment, |record| record.mark_finished());
                self.publish(deployment, DeploymentEventKind::Finished).await;
            }
            Err(Interrupt::Cancelled) => {
                // A cancel between phases is always a legal transition.
                let _ = fsm.process(DeploymentEvent::Cancel);
                self.cleanup(server, &workdir).await;
                self.finalize(deployment, |record| record.mark_cancelled());
                self.publish(deployment, DeploymentEventKind::Cancelled).await;
            }
            Err(Interrupt::Failed(err)) => {
                let message = err.to_string();
                let _ = fsm.process(DeploymentEvent::Fail(message.clone()));
                self.cleanup(server, &workdir).await;
                self.finalize(deployment, |record| record.mark_failed(message.clone()));
                self.publish(
                    deployment,
                    DeploymentEventKind::Failed {
                        error: message.clone(),
                    },
                )
                .await;
                if !err.is_expected() {
                    self.alerts
                        .alert(&format!(
                            "deployment {} for {} hit an unexpected error: {}",
                            deployment.id, application.name, message
                        ))
                        .await;
                }
            }
        }

        DeploymentOutcome {
            state: deployment.status,
            commit_sha: deployment.commit_sha.clone(),
            config_hash,
            restart_count: deployment.restart_count,
        }
    }

    async fn run_pipeline(
        &self,
        application: &mut Application,
        server: &Server,
        source: &Source,
        deployment: &mut Deployment,
        cancel: &CancellationFlag,
        fsm: &mut DeploymentStateMachine,
    ) -> Result<(), Interrupt> {
        let timeout = self.options.command_timeout;
        let workdir = self.workdir(deployment);

        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::Start)?;

        // Preparing: resolve the source to a commit or image reference.
        let resolved = source.resolve(self.executor.as_ref(), server, timeout).await?;
        if let ResolvedSource::Commit(sha) = &resolved {
            deployment.commit_sha = Some(sha.clone());
            self.store.save(deployment);
        }
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::SourceResolved)?;

        // Cloning: fetch the source into a validated working directory.
        self.fetch_source(server, source, &resolved, &workdir).await?;
        self.refresh_healthcheck_flag(application, server, &workdir).await?;
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::SourceFetched)?;

        // Building: run the build pack and generate the compose document.
        self.build_image(application, server, &resolved, &workdir).await?;
        let context = BuildContext {
            application,
            resolved: &resolved,
            workdir: workdir.clone(),
        };
        let generator = GeneratorFactory::create(application.build_pack);
        let raw = generator.generate(&context).await?;
        let graph = parse(&raw)?;
        // Services are matched to prior records by name and stack id only;
        // an image change updates the record instead of duplicating it.
        self.services.reconcile(application.id, &graph);
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::Built)?;

        // Label injection.
        let meta = InjectionMetadata {
            proxy: server.settings.proxy,
            network: application
                .settings
                .custom_network
                .clone()
                .unwrap_or_else(|| server.settings.proxy_network.clone()),
            domains: application.domains.clone(),
            stack_id: application.id,
            escape_container_labels: server.settings.escape_container_labels,
            use_network_aliases: server.settings.use_network_aliases,
            extra_aliases: application
                .settings
                .network_aliases
                .as_deref()
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|alias| !alias.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            requires_empty_env_file: application.build_pack.requires_empty_env_file(),
        };
        let document = inject(&graph, &raw, &meta)?;
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::LabelsInjected)?;

        // Pushing: upload the deploy-time document.
        self.push_document(server, &workdir, &document).await?;
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::Pushed)?;

        // Starting.
        let up = format!(
            "docker compose -f {}/docker-compose.yml up -d --remove-orphans",
            escape_shell_argument(&workdir)
        );
        self.executor
            .run(server, &up, self.options.fetch_timeout)
            .await?
            .into_result()?;
        self.checkpoint(cancel)?;
        self.advance(fsm, DeploymentEvent::Started)?;

        // Health checking.
        self.watch_health(application, server, deployment, &graph).await?;
        self.advance(fsm, DeploymentEvent::Healthy)?;

        Ok(())
    }

    fn workdir(&self, deployment: &Deployment) -> String {
        format!("{}/{}", self.options.workdir_base, deployment.id)
    }

    fn checkpoint(&self, cancel: &CancellationFlag) -> Result<(), Interrupt> {
        if cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn advance(
        &self,
        fsm: &mut DeploymentStateMachine,
        event: DeploymentEvent,
    ) -> Result<(), Interrupt> {
        let state = fsm
            .process(event)
            .map_err(|e| Interrupt::Failed(EngineError::Internal(e)))?;
        debug!("Deployment advanced to {:?}", state);
        Ok(())
    }

    async fn fetch_source(
        &self,
        server: &Server,
        source: &Source,
        resolved: &ResolvedSource,
        workdir: &str,
    ) -> Result<(), EngineError> {
        if !is_safe_tmp_path(workdir) {
            return Err(EngineError::Deployment(format!(
                "refusing unsafe working directory: {}",
                workdir
            )));
        }

        let mkdir = format!("mkdir -p {}", escape_shell_argument(workdir));
        self.executor
            .run(server, &mkdir, self.options.command_timeout)
            .await?
            .into_result()?;

        let (Source::Git { repository, .. }, ResolvedSource::Commit(sha)) = (source, resolved)
        else {
            return Ok(());
        };

        let clone = format!(
            "git clone {} {} && cd {} && git checkout {}",
            escape_shell_argument(repository.as_str()),
            escape_shell_argument(workdir),
            escape_shell_argument(workdir),
            escape_shell_argument(sha)
        );
        self.executor
            .run(server, &clone, self.options.fetch_timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    /// Update the stored HEALTHCHECK-detected flag from the fetched source.
    ///
    /// The flag tracks what the Dockerfile says, independent of whether
    /// healthchecks currently gate deployments; a removed directive resets
    /// it even while the toggle is off.
    async fn refresh_healthcheck_flag(
        &self,
        application: &mut Application,
        server: &Server,
        workdir: &str,
    ) -> Result<(), EngineError> {
        if application.build_pack != BuildPack::Dockerfile {
            return Ok(());
        }

        let base = application
            .settings
            .base_directory
            .as_deref()
            .map(|d| format!("{}/{}", workdir, d.trim_matches('/')))
            .unwrap_or_else(|| workdir.to_string());
        let cat = format!("cat {}/Dockerfile", escape_shell_argument(&base));
        let output = self
            .executor
            .run(server, &cat, self.options.command_timeout)
            .await?;

        let found = output.success() && dockerfile_has_healthcheck(&output.stdout);
        if application.custom_healthcheck_found != found {
            info!(
                "Healthcheck directive for {} changed: {} -> {}",
                application.name, application.custom_healthcheck_found, found
            );
        }
        application.custom_healthcheck_found = found;
        Ok(())
    }

    /// Packs that build on the server run their build here; the other
    /// packs have nothing to do before compose generation.
    async fn build_image(
        &self,
        application: &Application,
        server: &Server,
        resolved: &ResolvedSource,
        workdir: &str,
    ) -> Result<(), EngineError> {
        let ResolvedSource::Commit(sha) = resolved else {
            return Ok(());
        };
        let tag = format!("{}:{}", application.name, &sha[..7.min(sha.len())]);

        let command = match application.build_pack {
            BuildPack::Dockerfile => {
                let mut build = format!("docker build -t {}", escape_shell_argument(&tag));
                if application.settings.inject_build_args
                    && application.settings.include_source_commit
                {
                    build.push_str(&format!(
                        " --build-arg SOURCE_COMMIT={}",
                        escape_shell_argument(sha)
                    ));
                }
                build.push(' ');
                build.push_str(&escape_shell_argument(workdir));
                build
            }
            BuildPack::Nixpacks => format!(
                "nixpacks build {} --name {}",
                escape_shell_argument(workdir),
                escape_shell_argument(&tag)
            ),
            BuildPack::Buildpack => format!(
                "pack build {} --path {}",
                escape_shell_argument(&tag),
                escape_shell_argument(workdir)
            ),
            _ => return Ok(()),
        };

        self.executor
            .run(server, &command, self.options.fetch_timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    async fn push_document(
        &self,
        server: &Server,
        workdir: &str,
        document: &DeployTimeComposeDocument,
    ) -> Result<(), EngineError> {
        let yaml = document.to_yaml()?;
        let push = format!(
            "mkdir -p {dir} && printf '%s' {content} > {dir}/docker-compose.yml",
            dir = escape_shell_argument(workdir),
            content = escape_shell_argument(&yaml),
        );
        self.executor
            .run(server, &push, self.options.command_timeout)
            .await?
            .into_result()?;

        if document.requires_empty_env_file() {
            let touch = format!("touch {}/.env", escape_shell_argument(workdir));
            self.executor
                .run(server, &touch, self.options.command_timeout)
                .await?
                .into_result()?;
        }
        Ok(())
    }

    /// Poll container state after startup: aggregate restart counts into
    /// the record and, when healthchecks gate this application, wait for
    /// every container to report healthy.
    async fn watch_health(
        &self,
        application: &Application,
        server: &Server,
        deployment: &mut Deployment,
        graph: &ServiceGraph,
    ) -> Result<(), EngineError> {
        let timeout = self.options.command_timeout;
        let restarts = format!(
            "docker ps -q --filter label={}={} | xargs -r docker inspect --format '{{{{.RestartCount}}}}'",
            crate::compose::labels::STACK_LABEL,
            application.id
        );
        let output = self.executor.run(server, &restarts, timeout).await?;
        deployment.restart_count = max_restart_count(&output.stdout);
        self.store.save(deployment);

        let gated = application.settings.healthchecks_enabled
            && (application.custom_healthcheck_found
                || graph.services.iter().any(|s| s.is_database()));
        if !gated {
            return Ok(());
        }

        let health = format!(
            "docker ps -q --filter label={}={} | xargs -r docker inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{else}}}}none{{{{end}}}}'",
            crate::compose::labels::STACK_LABEL,
            application.id
        );
        let executor = Arc::clone(&self.executor);
        let healthy = crate::remote::executor::poll_until(
            self.options.health_attempts,
            self.options.health_interval,
            || {
                let executor = Arc::clone(&executor);
                let health = health.clone();
                async move {
                    match executor.run(server, &health, timeout).await {
                        Ok(output) => {
                            output.success()
                                && output
                                    .stdout
                                    .lines()
                                    .filter(|l| !l.trim().is_empty())
                                    .all(|l| matches!(l.trim(), "healthy" | "none"))
                        }
                        Err(err) => {
                            warn!("Health poll failed on {}: {}", server.name, err);
                            false
                        }
                    }
                }
            },
        )
        .await;

        if healthy {
            Ok(())
        } else {
            Err(EngineError::Deployment(
                "containers did not become healthy within the deadline".to_string(),
            ))
        }
    }

    /// Remove the working directory after a failed or cancelled run. Best
    /// effort; the path guard still applies.
    async fn cleanup(&self, server: &Server, workdir: &str) {
        if !is_safe_tmp_path(workdir) {
            warn!("Skipping cleanup of unsafe path: {}", workdir);
            return;
        }
        let remove = format!("rm -rf {}", escape_shell_argument(workdir));
        if let Err(err) = self
            .executor
            .run(server, &remove, self.options.command_timeout)
            .await
        {
            warn!("Cleanup of {} failed: {}", workdir, err);
        }
    }

    /// Apply a terminal marker to the freshest copy of the record. The
    /// store copy wins over the in-memory one; a missing record is logged
    /// and the in-memory copy is written back so status is never lost.
    fn finalize(&self, deployment: &mut Deployment, mark: impl Fn(&mut Deployment)) {
        match self.store.get(deployment.id) {
            Some(mut fresh) => {
                fresh.restart_count = deployment.restart_count;
                fresh.commit_sha = deployment.commit_sha.clone();
                mark(&mut fresh);
                self.store.save(&fresh);
                *deployment = fresh;
            }
            None => {
                warn!(
                    "Deployment record {} missing from store at finalization",
                    deployment.id
                );
                mark(deployment);
                self.store.save(deployment);
            }
        }
    }

    async fn publish(&self, deployment: &Deployment, event: DeploymentEventKind) {
        let record = DeploymentEventRecord {
            deployment_id: deployment.id,
            application_id: deployment.application_id,
            event,
        };
        if let Err(err) = self.events.publish(record).await {
            warn!(
                "Failed to publish event for deployment {}: {}",
                deployment.id, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_hash_is_stable() {
        let app = Application::new("shop", BuildPack::Dockerfile);
        let first = configuration_hash(&app);
        let second = configuration_hash(&app);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_configuration_hash_changes_with_settings() {
        let mut app = Application::new("shop", BuildPack::Dockerfile);
        let before = configuration_hash(&app);
        app.settings.start_command = Some("npm start".to_string());
        assert_ne!(before, configuration_hash(&app));
    }

    #[test]
    fn test_false_and_unset_flag_hash_identically() {
        // Documented hash behavior: a flag explicitly disabled after never
        // being set produces the same hash as before.
        let mut app = Application::new("shop", BuildPack::Dockerfile);
        let unset = configuration_hash(&app);
        app.settings.healthchecks_enabled = false;
        assert_eq!(unset, configuration_hash(&app));
        app.settings.healthchecks_enabled = true;
        assert_ne!(unset, configuration_hash(&app));
    }

    #[test]
    fn test_needs_new_release() {
        let mut app = Application::new("shop", BuildPack::Dockerfile);
        let hash = configuration_hash(&app);
        assert!(needs_new_release(&app, &hash));

        app.config_hash = Some(hash.clone());
        assert!(!needs_new_release(&app, &hash));
        assert!(needs_new_release(&app, "different"));
    }

    #[test]
    fn test_dockerfile_healthcheck_detection() {
        assert!(dockerfile_has_healthcheck(
            "FROM alpine\nHEALTHCHECK CMD curl -f http://localhost/\n"
        ));
        assert!(dockerfile_has_healthcheck(
            "FROM alpine\n  healthcheck CMD true\n"
        ));
        assert!(!dockerfile_has_healthcheck(
            "FROM alpine\n# HEALTHCHECK CMD curl -f http://localhost/\n"
        ));
        assert!(!dockerfile_has_healthcheck("FROM alpine\nRUN true\n"));
    }

    #[test]
    fn test_max_restart_count() {
        assert_eq!(max_restart_count("0\n3\n1\n"), 3);
        assert_eq!(max_restart_count(""), 0);
        assert_eq!(max_restart_count("garbage\n2\n"), 2);
    }
}
