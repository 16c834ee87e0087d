//! Deployment execution record

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::state::DeploymentState;

/// One execution of the engine against one source for one application.
///
/// Owned exclusively by the deployment engine; status, last error and the
/// restart counter stay queryable after any failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub server_id: Uuid,
    pub status: DeploymentState,

    /// Resolved commit sha for git sources.
    pub commit_sha: Option<String>,

    /// Maximum restart count observed across the stack's containers.
    #[serde(default)]
    pub restart_count: u32,

    /// Retry attempts consumed by the job runner.
    #[serde(default)]
    pub attempts: u32,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(application_id: Uuid, server_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            application_id,
            server_id,
            status: DeploymentState::Queued,
            commit_sha: None,
            restart_count: 0,
            attempts: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn mark_finished(&mut self) {
        self.status = DeploymentState::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = DeploymentState::Failed;
        self.error_message = Some(message.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = DeploymentState::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// In-memory persistence for deployment records.
///
/// The engine and the job worker communicate through this store rather
/// than trusting in-memory copies: a timed-out job reloads the record
/// before writing final status, since the timeout may race a concurrent
/// update.
#[derive(Debug, Default)]
pub struct DeploymentStore {
    records: Mutex<HashMap<Uuid, Deployment>>,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, deployment: &Deployment) {
        self.records
            .lock()
            .expect("poisoned lock")
            .insert(deployment.id, deployment.clone());
    }

    pub fn get(&self, id: Uuid) -> Option<Deployment> {
        self.records.lock().expect("poisoned lock").get(&id).cloned()
    }
}
