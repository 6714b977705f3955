//! # Stateful Entities
//!
//! Every managed entity embeds an [`EntityMeta`]: its id, integer state
//! code, how many times the current state has been entered, and when.
//!
//! ## State counting
//!
//! `state_count` is 1 on first entry into a state and increments each time
//! the same state is re-entered (a retry). Moving to a different state
//! resets it to 1. Retry decisions are derived from it, see
//! [`EntitySendRetryManager`](crate::EntitySendRetryManager).
//!
//! ## Copy-on-write
//!
//! Transitions consume the entity and return the new value. Handlers load
//! an entity, produce a modified copy, and the store persists that copy
//! under the caller's lease.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};

use dsc_core::StateError;
use serde::{Deserialize, Serialize};

/// State enum of an entity type, persisted as an integer code.
pub trait EntityState:
    Copy + Eq + std::hash::Hash + Debug + Display + Send + Sync + 'static
{
    /// Persisted integer code.
    fn code(self) -> i32;

    /// Decode a persisted code.
    fn from_code(code: i32) -> Option<Self>;

    /// Whether no further transitions are possible.
    fn is_terminal(self) -> bool;
}

/// Persistent bookkeeping common to all entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    /// Immutable unique identifier.
    pub id: String,
    /// Current state code.
    pub state: i32,
    /// Number of times the current state was entered.
    pub state_count: u32,
    /// Epoch millis of the last transition.
    pub state_timestamp: i64,
    /// Failure cause, set when the entity enters an error state.
    pub error_detail: Option<String>,
    /// Epoch millis of creation.
    pub created_at: i64,
    /// Epoch millis of the last modification.
    pub updated_at: i64,
    /// Opaque correlation data propagated to collaborators.
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
}

impl EntityMeta {
    /// Metadata for a new entity in its unsaved state. The count is 0
    /// until the first real transition.
    pub fn new(id: impl Into<String>, state: i32, now: i64) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 0,
            state_timestamp: now,
            error_detail: None,
            created_at: now,
            updated_at: now,
            trace_context: BTreeMap::new(),
        }
    }

    /// Enter `state` at `now`.
    pub fn transition_to(&mut self, state: i32, now: i64) {
        if self.state == state {
            self.state_count = self.state_count.saturating_add(1);
        } else {
            self.state = state;
            self.state_count = 1;
        }
        self.state_timestamp = now;
        self.updated_at = now;
    }

    /// Stamp the current state as re-examined at `now`, keeping its count.
    /// Moves the entity behind its peers in `next_for_state` order.
    pub fn touch(&mut self, now: i64) {
        self.state_timestamp = now;
        self.updated_at = now;
    }
}

/// An entity driven by a [`StateMachineManager`](crate::StateMachineManager).
pub trait StatefulEntity: Clone + Debug + Serialize + Send + Sync + 'static {
    /// The entity's state enum.
    type State: EntityState;

    /// Lifecycle event type published after persistence.
    type Event: Clone + Debug + Send + Sync + 'static;

    /// Name used in logs and errors.
    const TYPE_NAME: &'static str;

    /// Shared bookkeeping.
    fn meta(&self) -> &EntityMeta;

    /// Mutable shared bookkeeping.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// State entered on unrecoverable failure.
    fn error_state() -> Self::State;

    /// Event published when the manager moves the entity to its error
    /// state.
    fn failure_event(&self) -> Self::Event;

    /// Entity id.
    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Decoded current state.
    fn state(&self) -> Result<Self::State, StateError> {
        let code = self.meta().state;
        Self::State::from_code(code).ok_or(StateError::UnknownStateCode {
            entity_type: Self::TYPE_NAME,
            code,
        })
    }

    /// Move to the error state, recording `detail`.
    fn into_error(mut self, detail: impl Into<String>, now: i64) -> Self {
        let code = Self::error_state().code();
        let meta = self.meta_mut();
        meta.transition_to(code, now);
        meta.error_detail = Some(detail.into());
        self
    }
}
