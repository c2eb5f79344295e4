//! Per-rollout serialization.
//!
//! Ticks and operator actions for the same rollout take the same lock, so at
//! most one of them mutates a rollout at a time. Ticks never wait: if the
//! lock is held they skip the rollout for this cycle. Operator actions wait
//! up to a deadline and then report the rollout as busy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{RolloutError, RolloutResult};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Held while a rollout is being mutated.
///
/// Dropping the last guard of a rollout with no waiters removes its slot
/// from the table.
#[derive(Debug)]
pub struct RolloutGuard {
    guard: OwnedMutexGuard<()>,
    slots: Slots,
    rollout_id: String,
}

impl Drop for RolloutGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mutex = OwnedMutexGuard::mutex(&self.guard);
        // Only the table and this guard reference the slot: nobody is waiting.
        let idle = slots
            .get(&self.rollout_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, mutex) && Arc::strong_count(mutex) == 2);
        if idle {
            slots.remove(&self.rollout_id);
        }
    }
}

/// Lock table keyed by rollout ID. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct RolloutLocks {
    slots: Slots,
}

impl RolloutLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, rollout_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(rollout_id.to_string()).or_default())
    }

    fn wrap(&self, rollout_id: &str, guard: OwnedMutexGuard<()>) -> RolloutGuard {
        RolloutGuard {
            guard,
            slots: Arc::clone(&self.slots),
            rollout_id: rollout_id.to_string(),
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, rollout_id: &str) -> Option<RolloutGuard> {
        let guard = self.slot(rollout_id).try_lock_owned().ok()?;
        Some(self.wrap(rollout_id, guard))
    }

    /// Wait up to `timeout` for the lock, then give up with `Busy`.
    pub async fn acquire(&self, rollout_id: &str, timeout: Duration) -> RolloutResult<RolloutGuard> {
        let slot = self.slot(rollout_id);
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| RolloutError::Busy(rollout_id.to_string()))?;
        Ok(self.wrap(rollout_id, guard))
    }

    /// Whether someone currently holds the lock.
    pub fn is_held(&self, rollout_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(rollout_id)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of rollouts with a live slot.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let locks = RolloutLocks::new();
        let guard = locks.try_acquire("ro-1").unwrap();
        assert!(locks.is_held("ro-1"));
        assert!(locks.try_acquire("ro-1").is_none());
        // Other rollouts are independent.
        assert!(locks.try_acquire("ro-2").is_some());

        drop(guard);
        assert!(!locks.is_held("ro-1"));
        assert!(locks.try_acquire("ro-1").is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_as_busy() {
        let locks = RolloutLocks::new();
        let _guard = locks.try_acquire("ro-1").unwrap();

        let err = locks
            .acquire("ro-1", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Busy(id) if id == "ro-1"));
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let locks = RolloutLocks::new();
        let guard = locks.try_acquire("ro-1").unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("ro-1", Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn table_shrinks_when_locks_are_released() {
        let locks = RolloutLocks::new();
        for i in 0..100 {
            let id = format!("unknown-{i}");
            let guard = locks.acquire(&id, Duration::from_millis(50)).await.unwrap();
            drop(guard);
            assert!(!locks.is_held(&id));
            drop(locks.try_acquire(&id).unwrap());
        }
        assert!(locks.is_empty());

        // A queued waiter keeps the slot alive until it is done.
        let held = locks.try_acquire("ro-1").unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.acquire("ro-1", Duration::from_secs(5)).await.unwrap();
                let during = locks.len();
                drop(guard);
                during
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_no_slot_behind() {
        let locks = RolloutLocks::new();
        let held = locks.try_acquire("ro-1").unwrap();
        assert!(locks.acquire("ro-1", Duration::from_millis(10)).await.is_err());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }
}
