//! # Leases
//!
//! A lease grants one worker exclusive, time-bounded ownership of an entity.
//! A lease is expired when `now - leased_at > duration`; an expired lease
//! may be taken over by any worker.
//!
//! [`LeaseRegistry`] makes acquire-or-reject a single critical section, so
//! two workers racing for the same entity cannot both succeed.

use std::collections::HashMap;

use dsc_core::WorkerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An exclusive claim on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Holder.
    pub leased_by: WorkerId,
    /// Epoch millis at acquisition.
    pub leased_at: i64,
    /// Validity in millis.
    pub duration_millis: i64,
}

impl Lease {
    /// Whether the lease has run out at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.leased_at > self.duration_millis
    }

    /// Whether `worker` holds this lease and it is still valid.
    pub fn is_held_by(&self, worker: &WorkerId, now: i64) -> bool {
        &self.leased_by == worker && !self.is_expired(now)
    }
}

/// Atomic lease bookkeeping keyed by entity id.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<String, Lease>>,
}

impl LeaseRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease on `entity_id` for `worker`.
    ///
    /// Succeeds when there is no lease, the lease has expired, or `worker`
    /// already holds it (the lease is then renewed).
    pub fn acquire(&self, entity_id: &str, worker: &WorkerId, now: i64, duration_millis: i64) -> bool {
        let mut leases = self.leases.lock();
        Self::acquire_locked(&mut leases, entity_id, worker, now, duration_millis)
    }

    pub(crate) fn acquire_locked(
        leases: &mut HashMap<String, Lease>,
        entity_id: &str,
        worker: &WorkerId,
        now: i64,
        duration_millis: i64,
    ) -> bool {
        if let Some(existing) = leases.get(entity_id) {
            if &existing.leased_by != worker && !existing.is_expired(now) {
                return false;
            }
        }
        leases.insert(
            entity_id.to_string(),
            Lease {
                leased_by: worker.clone(),
                leased_at: now,
                duration_millis,
            },
        );
        true
    }

    /// Release the lease on `entity_id` if `worker` holds it.
    pub fn release(&self, entity_id: &str, worker: &WorkerId) -> bool {
        let mut leases = self.leases.lock();
        match leases.get(entity_id) {
            Some(lease) if &lease.leased_by == worker => {
                leases.remove(entity_id);
                true
            }
            _ => false,
        }
    }

    /// Remove any lease on `entity_id`, whoever holds it.
    pub fn break_lease(&self, entity_id: &str) -> Option<Lease> {
        self.leases.lock().remove(entity_id)
    }

    /// The current unexpired lease on `entity_id`.
    pub fn current(&self, entity_id: &str, now: i64) -> Option<Lease> {
        self.leases
            .lock()
            .get(entity_id)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    /// Whether a worker other than `worker` holds an unexpired lease.
    pub fn is_leased_by_other(&self, entity_id: &str, worker: &WorkerId, now: i64) -> bool {
        self.current(entity_id, now)
            .is_some_and(|l| &l.leased_by != worker)
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[test]
    fn expiry_is_strictly_after_duration() {
        let lease = Lease {
            leased_by: w("a"),
            leased_at: 100,
            duration_millis: 50,
        };
        assert!(!lease.is_expired(150));
        assert!(lease.is_expired(151));
    }

    #[test]
    fn second_worker_is_rejected_until_expiry() {
        let registry = LeaseRegistry::new();
        assert!(registry.acquire("e1", &w("a"), 0, 10));
        assert!(!registry.acquire("e1", &w("b"), 5, 10));
        assert!(!registry.acquire("e1", &w("b"), 10, 10));
        assert!(registry.acquire("e1", &w("b"), 11, 10));
        assert_eq!(registry.current("e1", 11).map(|l| l.leased_by), Some(w("b")));
    }

    #[test]
    fn same_worker_reacquires() {
        let registry = LeaseRegistry::new();
        assert!(registry.acquire("e1", &w("a"), 0, 10));
        assert!(registry.acquire("e1", &w("a"), 5, 10));
        assert_eq!(registry.current("e1", 5).map(|l| l.leased_at), Some(5));
    }

    #[test]
    fn release_only_by_holder() {
        let registry = LeaseRegistry::new();
        registry.acquire("e1", &w("a"), 0, 10);
        assert!(!registry.release("e1", &w("b")));
        assert!(registry.is_leased_by_other("e1", &w("b"), 1));
        assert!(registry.release("e1", &w("a")));
        assert!(registry.current("e1", 1).is_none());
    }

    #[test]
    fn break_lease_removes_any_holder() {
        let registry = LeaseRegistry::new();
        registry.acquire("e1", &w("a"), 0, 10);
        assert!(registry.break_lease("e1").is_some());
        assert!(registry.acquire("e1", &w("b"), 1, 10));
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        use std::sync::Arc;

        let registry = Arc::new(LeaseRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.acquire("e1", &w(&format!("w{i}")), 0, 1_000))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
