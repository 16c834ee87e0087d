//! Deployment state machine

use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Waiting for a worker
    Queued,

    /// Resolving the source (ref listing, sha extraction)
    Preparing,

    /// Fetching the source onto the server
    Cloning,

    /// Build-pack generation of the compose document
    Building,

    /// Computing and merging routing/ownership labels
    LabelInjecting,

    /// Uploading the deploy-time document to the server
    Pushing,

    /// Bringing the stack up
    Starting,

    /// Polling container health
    HealthChecking,

    /// Successfully deployed
    Finished,

    /// Terminal failure
    Failed,

    /// Explicitly cancelled
    Cancelled,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Finished | DeploymentState::Failed | DeploymentState::Cancelled
        )
    }
}

/// State machine event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Worker picked the deployment up
    Start,

    /// Source resolved to a commit or image
    SourceResolved,

    /// Source fetched onto the server
    SourceFetched,

    /// Build pack produced a compose document
    Built,

    /// Deploy-time document assembled
    LabelsInjected,

    /// Document uploaded
    Pushed,

    /// Stack started
    Started,

    /// Containers healthy
    Healthy,

    /// Failure from any non-terminal state
    Fail(String),

    /// Explicit cancellation from any non-terminal state
    Cancel,
}

/// Drives one deployment through its states.
#[derive(Debug, Clone)]
pub struct DeploymentStateMachine {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentStateMachine {
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Queued,
            error: None,
        }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state. Invalid transitions are
    /// rejected without changing state.
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentState, String> {
        let new_state = match (&self.state, &event) {
            // Failure and cancellation are reachable from any non-terminal
            // state.
            (state, DeploymentEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }
            (state, DeploymentEvent::Cancel) if !state.is_terminal() => DeploymentState::Cancelled,

            // The forward path is strictly sequential.
            (DeploymentState::Queued, DeploymentEvent::Start) => DeploymentState::Preparing,
            (DeploymentState::Preparing, DeploymentEvent::SourceResolved) => {
                DeploymentState::Cloning
            }
            (DeploymentState::Cloning, DeploymentEvent::SourceFetched) => DeploymentState::Building,
            (DeploymentState::Building, DeploymentEvent::Built) => DeploymentState::LabelInjecting,
            (DeploymentState::LabelInjecting, DeploymentEvent::LabelsInjected) => {
                DeploymentState::Pushing
            }
            (DeploymentState::Pushing, DeploymentEvent::Pushed) => DeploymentState::Starting,
            (DeploymentState::Starting, DeploymentEvent::Started) => {
                DeploymentState::HealthChecking
            }
            (DeploymentState::HealthChecking, DeploymentEvent::Healthy) => {
                DeploymentState::Finished
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for DeploymentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut fsm = DeploymentStateMachine::new();
        assert_eq!(fsm.state(), DeploymentState::Queued);

        for event in [
            DeploymentEvent::Start,
            DeploymentEvent::SourceResolved,
            DeploymentEvent::SourceFetched,
            DeploymentEvent::Built,
            DeploymentEvent::LabelsInjected,
            DeploymentEvent::Pushed,
            DeploymentEvent::Started,
            DeploymentEvent::Healthy,
        ] {
            fsm.process(event).unwrap();
        }

        assert_eq!(fsm.state(), DeploymentState::Finished);
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_fail_from_any_non_terminal_state() {
        let mut fsm = DeploymentStateMachine::new();
        fsm.process(DeploymentEvent::Start).unwrap();
        fsm.process(DeploymentEvent::SourceResolved).unwrap();

        fsm.process(DeploymentEvent::Fail("clone failed".to_string()))
            .unwrap();
        assert_eq!(fsm.state(), DeploymentState::Failed);
        assert_eq!(fsm.error(), Some("clone failed"));

        // Terminal states accept no further events.
        assert!(fsm.process(DeploymentEvent::Fail("again".to_string())).is_err());
        assert!(fsm.process(DeploymentEvent::Cancel).is_err());
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        let mut fsm = DeploymentStateMachine::new();
        fsm.process(DeploymentEvent::Cancel).unwrap();
        assert_eq!(fsm.state(), DeploymentState::Cancelled);

        let mut fsm = DeploymentStateMachine::new();
        fsm.process(DeploymentEvent::Start).unwrap();
        fsm.process(DeploymentEvent::SourceResolved).unwrap();
        fsm.process(DeploymentEvent::SourceFetched).unwrap();
        fsm.process(DeploymentEvent::Cancel).unwrap();
        assert_eq!(fsm.state(), DeploymentState::Cancelled);
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let mut fsm = DeploymentStateMachine::new();
        assert!(fsm.process(DeploymentEvent::Pushed).is_err());
        assert_eq!(fsm.state(), DeploymentState::Queued);
    }
}
