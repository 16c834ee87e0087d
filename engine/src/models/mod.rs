//! Typed entity models

pub mod application;
pub mod deployment;
pub mod service;

pub use application::{Application, ApplicationSettings};
pub use deployment::{Deployment, DeploymentStore};
pub use service::{ServiceRecord, ServiceStore};
