//! Remote servers and command execution

pub mod executor;
pub mod server;

pub use executor::{poll_until, CommandOutput, RemoteExecutor, ScriptedExecutor, SshExecutor};
pub use server::{server_status, Server, ServerRegistry, ServerSettings};
