// backuptool/src/orchestrator/locks.rs
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Per-target mutual exclusion: binds a target name to the job currently
/// running for it. The single map mutex makes acquisition atomic with
/// respect to concurrent triggers; losers are rejected synchronously, there
/// is no queueing.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<String, Uuid>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the lock to `job_id`, or returns the holder's job id.
    pub fn acquire(&self, target: &str, job_id: Uuid) -> Result<(), Uuid> {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.get(target) {
            return Err(*holder);
        }
        inner.insert(target.to_string(), job_id);
        Ok(())
    }

    pub fn release(&self, target: &str) {
        if self.inner.lock().remove(target).is_none() {
            warn!(target, "released a lock that was not held");
        }
    }

    pub fn holder(&self, target: &str) -> Option<Uuid> {
        self.inner.lock().get(target).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Barrier;

    #[test]
    fn test_second_acquire_reports_the_holder() {
        let locks = LockRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(locks.acquire("tank-data", first).is_ok());
        assert_eq!(locks.acquire("tank-data", second), Err(first));
        // A different target is unaffected.
        assert!(locks.acquire("tank-home", second).is_ok());
    }

    #[test]
    fn test_release_makes_the_target_available_again() {
        let locks = LockRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(locks.acquire("tank-data", first).is_ok());
        locks.release("tank-data");
        assert_eq!(locks.holder("tank-data"), None);
        assert!(locks.acquire("tank-data", second).is_ok());
    }

    #[test]
    fn test_exactly_one_concurrent_acquirer_wins() {
        let locks = Arc::new(LockRegistry::new());
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire("tank-data", Uuid::new_v4()).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }
}
