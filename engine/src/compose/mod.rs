//! Docker Compose parsing, normalization and label injection
//!
//! The user-authored compose text is kept as a [`document::RawComposeDocument`]
//! and never mutated. Label injection produces a derived
//! [`document::DeployTimeComposeDocument`] that is regenerated on every
//! deployment.

pub mod classify;
pub mod document;
pub mod labels;
pub mod parse;
pub mod volume;

pub use classify::{classify_service, is_database_image, ServiceClassification};
pub use document::{DeployTimeComposeDocument, RawComposeDocument};
pub use labels::{inject, InjectionMetadata};
pub use parse::{parse, ServiceDefinition, ServiceGraph};
pub use volume::{parse_docker_volume_string, VolumeParts};
