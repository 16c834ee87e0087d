//! Deployment worker
//!
//! Pulls queued deploy tasks, guards each application with an overlap
//! lock, and runs the deployment engine under the job timeout. A timed-out
//! run reloads the record from the store before writing final status; the
//! timeout may have raced a concurrent update from the engine itself.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::engine::{CancellationFlag, DeploymentEngine};
use crate::deploy::source::Source;
use crate::deploy::state::DeploymentState;
use crate::jobs::lock::OverlapLockRegistry;
use crate::jobs::retry::{lock_key, JobKind, JobRetrySpec};
use crate::models::application::Application;
use crate::models::deployment::{Deployment, DeploymentStore};
use crate::remote::server::Server;

/// One queued deployment request.
#[derive(Debug)]
pub struct DeployTask {
    pub application: Application,
    pub server: Server,
    pub source: Source,
    pub deployment: Deployment,
    pub cancel: CancellationFlag,
}

/// In-memory task queue shared between producers and the worker.
#[derive(Debug, Default, Clone)]
pub struct DeployQueue {
    tasks: Arc<Mutex<VecDeque<DeployTask>>>,
}

impl DeployQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: DeployTask) {
        self.tasks.lock().expect("poisoned lock").push_back(task);
    }

    pub fn pop(&self) -> Option<DeployTask> {
        self.tasks.lock().expect("poisoned lock").pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deploy worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Run the deploy worker
pub async fn run<S, F>(
    options: &Options,
    queue: DeployQueue,
    engine: Arc<DeploymentEngine>,
    store: Arc<DeploymentStore>,
    locks: OverlapLockRegistry,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Deploy worker starting...");

    let spec = JobRetrySpec::for_kind(JobKind::Deployment);
    if let Err(e) = spec.validate() {
        error!("Deploy worker refusing to start: {}", e);
        return;
    }

    loop {
        // Check for shutdown
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deploy worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with check
            }
        }

        while let Some(task) = queue.pop() {
            let key = lock_key(JobKind::Deployment, task.application.id);
            let Some(_guard) = locks.acquire(&key, spec.lock_expiry) else {
                info!(
                    "Deployment for {} already in progress, requeueing",
                    task.application.name
                );
                queue.push(task);
                break;
            };

            execute_with_retries(&spec, task, &engine, &store, &sleep_fn).await;
        }
    }
}

async fn execute_with_retries<S, F>(
    spec: &JobRetrySpec,
    mut task: DeployTask,
    engine: &DeploymentEngine,
    store: &DeploymentStore,
    sleep_fn: &S,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let mut exceptions = 0;

    for attempt in 1..=spec.tries {
        if attempt > 1 {
            // Re-arm the record for another run.
            task.deployment.status = DeploymentState::Queued;
            task.deployment.error_message = None;
            task.deployment.finished_at = None;
            sleep_fn(spec.backoff_for(attempt - 1)).await;
        }
        task.deployment.attempts = attempt;

        debug!(
            "Running deployment {} (attempt {}/{})",
            task.deployment.id, attempt, spec.tries
        );

        let run = engine.deploy(
            &mut task.application,
            &task.server,
            &task.source,
            &mut task.deployment,
            &task.cancel,
        );

        match tokio::time::timeout(spec.timeout, run).await {
            Ok(outcome) => match outcome.state {
                DeploymentState::Finished => {
                    info!(
                        "Deployment {} finished (restarts: {})",
                        task.deployment.id, outcome.restart_count
                    );
                    return;
                }
                DeploymentState::Cancelled => {
                    info!("Deployment {} cancelled", task.deployment.id);
                    return;
                }
                state => {
                    warn!(
                        "Deployment {} attempt {} ended in {:?}",
                        task.deployment.id, attempt, state
                    );
                }
            },
            Err(_) => {
                exceptions += 1;
                error!(
                    "Deployment {} attempt {} exceeded the {}s job timeout",
                    task.deployment.id,
                    attempt,
                    spec.timeout.as_secs()
                );
                finalize_timed_out(store, &mut task.deployment);
            }
        }

        if exceptions >= spec.max_exceptions {
            error!(
                "Deployment {} gave up after {} exceptions",
                task.deployment.id, exceptions
            );
            return;
        }
    }

    error!(
        "Deployment {} exhausted all {} attempts",
        task.deployment.id, spec.tries
    );
}

/// Write the timeout verdict against the freshest copy of the record. The
/// engine may have finalized concurrently with the timeout firing; a record
/// that already reached a terminal state keeps it.
fn finalize_timed_out(store: &DeploymentStore, deployment: &mut Deployment) {
    let mut current = match store.get(deployment.id) {
        Some(record) => record,
        None => {
            warn!(
                "Deployment record {} missing from store after timeout",
                deployment.id
            );
            deployment.clone()
        }
    };

    if !current.status.is_terminal() {
        current.mark_failed("deployment exceeded the job timeout");
        store.save(&current);
    }
    *deployment = current;
}
