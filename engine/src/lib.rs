//! Dockhand Engine Library
//!
//! Core modules for the dockhand deployment engine: compose parsing and
//! label injection, remote command execution, the deployment pipeline,
//! proxy reconciliation and the background job workers.

pub mod app;
pub mod compose;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod remote;
pub mod shell;
