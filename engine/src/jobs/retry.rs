//! Per-job-kind retry policy

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;

/// The kinds of background jobs the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Deployment,
    Backup,
    ScheduledTask,
    Maintenance,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Deployment,
        JobKind::Backup,
        JobKind::ScheduledTask,
        JobKind::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Deployment => "deployment",
            JobKind::Backup => "backup",
            JobKind::ScheduledTask => "scheduled_task",
            JobKind::Maintenance => "maintenance",
        }
    }
}

/// Retry and locking parameters for one job kind.
///
/// `lock_expiry` is the overlap lock's time-to-live: it must outlive the
/// job timeout, otherwise a still-running job could lose its lock and a
/// duplicate could start against the same target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRetrySpec {
    /// Total attempts before the job is marked failed.
    pub tries: u32,

    /// Distinct exceptions tolerated before giving up early.
    pub max_exceptions: u32,

    /// Wall-clock limit for one attempt.
    pub timeout: Duration,

    /// Sleep before each retry, indexed by attempt.
    pub backoff: Vec<Duration>,

    /// Overlap lock time-to-live.
    pub lock_expiry: Duration,
}

impl JobRetrySpec {
    /// The policy for a job kind.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Deployment => Self {
                tries: 3,
                max_exceptions: 2,
                timeout: Duration::from_secs(3600),
                backoff: vec![Duration::from_secs(10), Duration::from_secs(30)],
                lock_expiry: Duration::from_secs(3900),
            },
            JobKind::Backup => Self {
                tries: 2,
                max_exceptions: 1,
                timeout: Duration::from_secs(7200),
                backoff: vec![Duration::from_secs(60)],
                lock_expiry: Duration::from_secs(7500),
            },
            JobKind::ScheduledTask => Self {
                tries: 1,
                max_exceptions: 1,
                timeout: Duration::from_secs(900),
                backoff: Vec::new(),
                lock_expiry: Duration::from_secs(960),
            },
            JobKind::Maintenance => Self {
                tries: 2,
                max_exceptions: 2,
                timeout: Duration::from_secs(600),
                backoff: vec![Duration::from_secs(30)],
                lock_expiry: Duration::from_secs(900),
            },
        }
    }

    /// Validate the lock-outlives-timeout invariant.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.lock_expiry.is_zero() {
            return Err(EngineError::Config(
                "job lock expiry must be greater than zero".to_string(),
            ));
        }
        if self.lock_expiry < self.timeout {
            return Err(EngineError::Config(format!(
                "job lock expiry ({:?}) must not be shorter than the job timeout ({:?})",
                self.lock_expiry, self.timeout
            )));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based retries). Past the
    /// configured schedule the last entry repeats; an empty schedule means
    /// immediate retry.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx.min(self.backoff.len().saturating_sub(1)))
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// The overlap lock key for a job kind against a target entity.
pub fn lock_key(kind: JobKind, target: Uuid) -> String {
    format!("{}:{}", kind.as_str(), target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_satisfies_the_lock_invariant() {
        for kind in JobKind::ALL {
            JobRetrySpec::for_kind(kind).validate().unwrap();
        }
    }

    #[test]
    fn test_validate_rejects_lock_shorter_than_timeout() {
        let mut spec = JobRetrySpec::for_kind(JobKind::Deployment);
        spec.lock_expiry = spec.timeout - Duration::from_secs(1);
        assert!(spec.validate().is_err());

        spec.lock_expiry = Duration::ZERO;
        spec.timeout = Duration::ZERO;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_backoff_repeats_last_entry() {
        let spec = JobRetrySpec::for_kind(JobKind::Deployment);
        assert_eq!(spec.backoff_for(1), Duration::from_secs(10));
        assert_eq!(spec.backoff_for(2), Duration::from_secs(30));
        assert_eq!(spec.backoff_for(9), Duration::from_secs(30));

        let empty = JobRetrySpec {
            backoff: Vec::new(),
            ..spec
        };
        assert_eq!(empty.backoff_for(1), Duration::ZERO);
    }

    #[test]
    fn test_lock_key_is_kind_scoped() {
        let id = Uuid::new_v4();
        assert_ne!(
            lock_key(JobKind::Deployment, id),
            lock_key(JobKind::Backup, id)
        );
        assert!(lock_key(JobKind::Deployment, id).starts_with("deployment:"));
    }
}
