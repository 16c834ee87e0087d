//! The deployment pipeline

pub mod buildpack;
pub mod engine;
pub mod source;
pub mod state;

pub use buildpack::BuildPack;
pub use engine::{
    configuration_hash, needs_new_release, CancellationFlag, DeployOptions, DeploymentEngine,
    DeploymentOutcome,
};
pub use source::Source;
pub use state::{DeploymentEvent, DeploymentState, DeploymentStateMachine};
