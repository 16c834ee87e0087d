//! Background jobs: retry policy, overlap locking and the deploy worker

pub mod deployer;
pub mod lock;
pub mod proxy_check;
pub mod retry;

pub use deployer::{DeployQueue, DeployTask};
pub use lock::{OverlapGuard, OverlapLockRegistry};
pub use retry::{JobKind, JobRetrySpec};
