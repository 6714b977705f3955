//! # Entity Stores
//!
//! [`EntityStore`] is the persistence contract the managers are written
//! against. It is the single source of truth and the only synchronization
//! point between workers: correctness across replicas rests on
//! `next_for_state` and `save` honouring leases atomically.
//!
//! [`InMemoryEntityStore`] is the reference implementation. It follows the
//! shared-map idiom (`Arc<RwLock<HashMap>>`, clone-out reads, no lock held
//! across an `.await`) and adds a shared [`LeaseRegistry`]. Handles for
//! different workers over the same data are made with
//! [`InMemoryEntityStore::for_worker`].

use std::collections::HashMap;
use std::sync::Arc;

use dsc_core::{Clock, QueryError, QueryResolver, QuerySpec, WorkerId};
use parking_lot::RwLock;
use thiserror::Error;

use crate::entity::StatefulEntity;
use crate::lease::LeaseRegistry;

/// Default lease validity.
pub const DEFAULT_LEASE_DURATION_MILLIS: i64 = 60_000;

/// Errors raised by an entity store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another worker holds an unexpired lease on the entity.
    #[error("entity {id} is leased by {holder}")]
    LeaseHeld {
        /// Entity id.
        id: String,
        /// Current holder.
        holder: String,
    },

    /// The query could not be resolved.
    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence contract for stateful entities.
pub trait EntityStore<T: StatefulEntity>: Send + Sync {
    /// Load an entity regardless of leases.
    fn find(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// Upsert an entity and release the caller's lease on it.
    ///
    /// Fails with [`StoreError::LeaseHeld`] if another worker holds an
    /// unexpired lease.
    fn save(&self, entity: T) -> Result<(), StoreError>;

    /// Remove an entity. Fails if another worker holds a lease on it.
    fn delete(&self, id: &str) -> Result<Option<T>, StoreError>;

    /// Lease and return up to `max` entities in state `state`, oldest
    /// `state_timestamp` first, skipping entities with an unexpired lease.
    fn next_for_state(&self, state: i32, max: usize) -> Result<Vec<T>, StoreError>;

    /// Filter, sort and page over all entities.
    fn query(&self, spec: &QuerySpec) -> Result<Vec<T>, StoreError>;

    /// Release the caller's lease on `id` without saving.
    fn break_lease(&self, id: &str) -> Result<(), StoreError>;
}

/// In-memory [`EntityStore`] shared between worker handles.
pub struct InMemoryEntityStore<T: StatefulEntity> {
    data: Arc<RwLock<HashMap<String, T>>>,
    leases: Arc<LeaseRegistry>,
    worker: WorkerId,
    clock: Arc<dyn Clock>,
    lease_duration_millis: i64,
}

impl<T: StatefulEntity> Clone for InMemoryEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            leases: Arc::clone(&self.leases),
            worker: self.worker.clone(),
            clock: Arc::clone(&self.clock),
            lease_duration_millis: self.lease_duration_millis,
        }
    }
}

impl<T: StatefulEntity> std::fmt::Debug for InMemoryEntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEntityStore")
            .field("entity_type", &T::TYPE_NAME)
            .field("worker", &self.worker)
            .field("entities", &self.data.read().len())
            .finish()
    }
}

impl<T: StatefulEntity> InMemoryEntityStore<T> {
    /// An empty store operated by `worker`.
    pub fn new(worker: WorkerId, clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            leases: Arc::new(LeaseRegistry::new()),
            worker,
            clock,
            lease_duration_millis: DEFAULT_LEASE_DURATION_MILLIS,
        }
    }

    /// Set the validity of leases taken by this handle.
    pub fn with_lease_duration(mut self, millis: i64) -> Self {
        self.lease_duration_millis = millis;
        self
    }

    /// A handle over the same data and leases, operated by `worker`.
    pub fn for_worker(&self, worker: WorkerId) -> Self {
        Self {
            worker,
            ..self.clone()
        }
    }

    /// The worker operating this handle.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// The shared lease registry.
    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Every stored entity, ordered by id.
    pub fn all(&self) -> Vec<T> {
        let mut all: Vec<T> = self.data.read().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    fn check_lease(&self, id: &str, now: i64) -> Result<(), StoreError> {
        match self.leases.current(id, now) {
            Some(lease) if lease.leased_by != self.worker => Err(StoreError::LeaseHeld {
                id: id.to_string(),
                holder: lease.leased_by.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl<T: StatefulEntity> EntityStore<T> for InMemoryEntityStore<T> {
    fn find(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.data.read().get(id).cloned())
    }

    fn save(&self, entity: T) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let id = entity.id().to_string();
        let mut data = self.data.write();
        self.check_lease(&id, now)?;
        data.insert(id.clone(), entity);
        self.leases.release(&id, &self.worker);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<Option<T>, StoreError> {
        let now = self.clock.now_millis();
        let mut data = self.data.write();
        self.check_lease(id, now)?;
        self.leases.break_lease(id);
        Ok(data.remove(id))
    }

    fn next_for_state(&self, state: i32, max: usize) -> Result<Vec<T>, StoreError> {
        let now = self.clock.now_millis();
        let data = self.data.read();
        let mut leases = self.leases.lock();

        let mut candidates: Vec<&T> = data
            .values()
            .filter(|e| e.meta().state == state)
            .filter(|e| {
                leases
                    .get(e.id())
                    .map_or(true, |lease| lease.is_expired(now))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.meta()
                .state_timestamp
                .cmp(&b.meta().state_timestamp)
                .then_with(|| a.id().cmp(b.id()))
        });

        let mut batch = Vec::with_capacity(max.min(candidates.len()));
        for entity in candidates.into_iter().take(max) {
            if LeaseRegistry::acquire_locked(
                &mut leases,
                entity.id(),
                &self.worker,
                now,
                self.lease_duration_millis,
            ) {
                batch.push(entity.clone());
            }
        }
        Ok(batch)
    }

    fn query(&self, spec: &QuerySpec) -> Result<Vec<T>, StoreError> {
        let all = self.all();
        Ok(QueryResolver::resolve(spec, all)?)
    }

    fn break_lease(&self, id: &str) -> Result<(), StoreError> {
        self.leases.release(id, &self.worker);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_entity::{Job, JobState};
    use crate::entity::EntityState;
    use dsc_core::{Criterion, ManualClock, SortOrder};

    fn store(clock: &Arc<ManualClock>) -> InMemoryEntityStore<Job> {
        InMemoryEntityStore::new(WorkerId::new("w1"), clock.clone() as Arc<dyn Clock>)
            .with_lease_duration(100)
    }

    fn seed(store: &InMemoryEntityStore<Job>, n: usize, state: JobState) {
        for i in 0..n {
            store
                .save(Job::new(&format!("job-{i:02}"), state, i as i64))
                .unwrap();
        }
    }

    // ── Leasing ─────────────────────────────────────────────────────

    #[test]
    fn next_for_state_leases_until_saved() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        seed(&store, 1, JobState::Initial);

        let first = store.next_for_state(JobState::Initial.code(), 5).unwrap();
        assert_eq!(first.len(), 1);
        assert!(store
            .next_for_state(JobState::Initial.code(), 5)
            .unwrap()
            .is_empty());

        store.save(first[0].clone()).unwrap();
        assert_eq!(store.next_for_state(JobState::Initial.code(), 5).unwrap().len(), 1);
    }

    #[test]
    fn successive_batches_are_disjoint() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        seed(&store, 10, JobState::Initial);

        let a = store.next_for_state(JobState::Initial.code(), 5).unwrap();
        let b = store.next_for_state(JobState::Initial.code(), 5).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(b.len(), 5);
        assert!(a.iter().all(|x| b.iter().all(|y| x.id() != y.id())));
    }

    #[test]
    fn oldest_state_timestamp_first() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        for (id, ts) in [("c", 30), ("a", 10), ("b", 20)] {
            store.save(Job::new(id, JobState::Initial, ts)).unwrap();
        }
        let batch = store.next_for_state(JobState::Initial.code(), 2).unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.id().to_string()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn expired_lease_is_reclaimable_by_other_worker() {
        let clock = Arc::new(ManualClock::new(0));
        let w1 = store(&clock);
        let w2 = w1.for_worker(WorkerId::new("w2"));
        seed(&w1, 1, JobState::Initial);

        assert_eq!(w1.next_for_state(JobState::Initial.code(), 1).unwrap().len(), 1);
        assert!(w2.next_for_state(JobState::Initial.code(), 1).unwrap().is_empty());

        clock.set(101);
        assert_eq!(w2.next_for_state(JobState::Initial.code(), 1).unwrap().len(), 1);
    }

    #[test]
    fn save_under_foreign_lease_is_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let w1 = store(&clock);
        let w2 = w1.for_worker(WorkerId::new("w2"));
        seed(&w1, 1, JobState::Initial);

        let leased = w1.next_for_state(JobState::Initial.code(), 1).unwrap();
        let err = w2.save(leased[0].clone()).unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { .. }));
        assert!(matches!(
            w2.delete("job-00").unwrap_err(),
            StoreError::LeaseHeld { .. }
        ));
        w1.save(leased[0].clone()).unwrap();
        assert!(w2.delete("job-00").unwrap().is_some());
    }

    #[test]
    fn break_lease_makes_entity_eligible_again() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        seed(&store, 1, JobState::Initial);
        let batch = store.next_for_state(JobState::Initial.code(), 1).unwrap();
        store.break_lease(batch[0].id()).unwrap();
        assert_eq!(store.next_for_state(JobState::Initial.code(), 1).unwrap().len(), 1);
    }

    #[test]
    fn other_states_are_not_returned() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        seed(&store, 3, JobState::Running);
        assert!(store
            .next_for_state(JobState::Initial.code(), 10)
            .unwrap()
            .is_empty());
    }

    // ── Persistence and queries ─────────────────────────────────────

    #[test]
    fn save_then_find_preserves_bookkeeping() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        let job = Job::new("j", JobState::Running, 7).into_error("bad input", 8);
        store.save(job.clone()).unwrap();
        let found = store.find("j").unwrap().unwrap();
        assert_eq!(found.meta, job.meta);
        assert!(store.find("missing").unwrap().is_none());
    }

    #[test]
    fn query_pages_filters_and_sorts() {
        let clock = Arc::new(ManualClock::new(0));
        let store = store(&clock);
        seed(&store, 10, JobState::Initial);

        let page = store
            .query(&QuerySpec::default().with_offset(3).with_limit(4))
            .unwrap();
        assert_eq!(page.len(), 4);

        let rest = store
            .query(&QuerySpec::default().with_offset(5).with_limit(100))
            .unwrap();
        assert_eq!(rest.len(), 5);

        let one = store
            .query(&QuerySpec::max().with_criterion(Criterion::eq("meta.id", "job-04")))
            .unwrap();
        assert_eq!(one.len(), 1);

        let desc = store
            .query(&QuerySpec::max().with_sort("meta.id", SortOrder::Desc))
            .unwrap();
        assert_eq!(desc[0].id(), "job-09");

        let unknown = store
            .query(&QuerySpec::max().with_sort("meta.nope", SortOrder::Asc))
            .unwrap();
        assert!(unknown.is_empty());
    }
}
