//! In-process overlap locking for background jobs
//!
//! Prevents two workers from running the same job kind against the same
//! target concurrently. Locks expire: a holder that dies without releasing
//! (a panicked task, a hard timeout) only blocks the key until the expiry
//! elapses, after which the key can be reclaimed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
struct Holder {
    deadline: Instant,
    token: u64,
}

/// Registry of held overlap locks, keyed by job lock key.
#[derive(Debug, Default, Clone)]
pub struct OverlapLockRegistry {
    held: Arc<Mutex<HashMap<String, Holder>>>,
    next_token: Arc<AtomicU64>,
}

impl OverlapLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the key for at most `expiry`. Returns `None` when a
    /// live (unexpired) holder exists; an expired holder is evicted and
    /// the key handed to the caller.
    pub fn acquire(&self, key: &str, expiry: Duration) -> Option<OverlapGuard> {
        let mut held = self.held.lock().expect("poisoned lock");
        let now = Instant::now();

        if let Some(holder) = held.get(key) {
            if holder.deadline > now {
                return None;
            }
            debug!("Reclaiming expired overlap lock: {}", key);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            key.to_string(),
            Holder {
                deadline: now + expiry,
                token,
            },
        );
        Some(OverlapGuard {
            registry: Arc::clone(&self.held),
            key: key.to_string(),
            token,
        })
    }
}

/// Releases the held key on drop. A guard whose lease was reclaimed after
/// expiry releases nothing; the reclaimer's lock survives.
#[derive(Debug)]
pub struct OverlapGuard {
    registry: Arc<Mutex<HashMap<String, Holder>>>,
    key: String,
    token: u64,
}

impl Drop for OverlapGuard {
    fn drop(&mut self) {
        let mut held = self.registry.lock().expect("poisoned lock");
        if held.get(&self.key).is_some_and(|h| h.token == self.token) {
            held.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_blocked_until_drop() {
        let registry = OverlapLockRegistry::new();
        let guard = registry.acquire("deploy:x", Duration::from_secs(60)).unwrap();
        assert!(registry.acquire("deploy:x", Duration::from_secs(60)).is_none());
        // Other keys are independent.
        assert!(registry.acquire("deploy:y", Duration::from_secs(60)).is_some());

        drop(guard);
        assert!(registry.acquire("deploy:x", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let registry = OverlapLockRegistry::new();
        let stale = registry.acquire("deploy:x", Duration::ZERO).unwrap();

        let reclaimed = registry.acquire("deploy:x", Duration::from_secs(60));
        assert!(reclaimed.is_some());

        // The stale holder's late release must not free the reclaimer's lock.
        drop(stale);
        assert!(registry.acquire("deploy:x", Duration::from_secs(60)).is_none());
    }
}
