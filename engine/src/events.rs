//! Event publishing and operator alerting seams
//!
//! Both collaborators are injected through constructors; nothing in the
//! engine reaches for an ambient global. Publish failures are the caller's
//! to log, never to propagate over the original outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::EngineError;

/// Lifecycle events emitted around a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeploymentEventKind {
    Queued,
    Finished,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEventRecord {
    pub deployment_id: Uuid,
    pub application_id: Uuid,
    pub event: DeploymentEventKind,
}

/// Publisher for deployment lifecycle events (queue/webhook/UI fan-out
/// lives behind this seam).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DeploymentEventRecord) -> Result<(), EngineError>;
}

/// Operator-facing alert channel for unexpected errors. Expected domain
/// failures never reach this sink.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, message: &str);
}

/// Publisher that only logs; useful as a default and in tests.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: DeploymentEventRecord) -> Result<(), EngineError> {
        info!(
            "Deployment {} for application {}: {:?}",
            event.deployment_id, event.application_id, event.event
        );
        Ok(())
    }
}

/// Alert sink that only logs at error level.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, message: &str) {
        error!("ALERT: {}", message);
    }
}
