//! # dsc-state: Persistent State-Machine Engine
//!
//! The engine that drives long-running entities (contract negotiations,
//! transfer processes) through their states, surviving restarts and
//! tolerating several workers polling one shared store.
//!
//! ## Building blocks
//!
//! - [`entity`]: the persistent record shape shared by every entity type.
//! - [`lease`]: exclusive, time-bounded ownership of an entity by a worker.
//! - [`store`]: the entity store contract and the in-memory reference store.
//! - [`retry`]: wait strategies and the send-retry manager.
//! - [`command`]: out-of-band commands applied between polling rounds.
//! - [`event`]: post-persistence event fan-out.
//! - [`dispatch`]: protocol-keyed remote message dispatch.
//! - [`manager`]: the generic polling manager that ties them together.
//!
//! ## Safety Invariant
//!
//! No two workers hold an unexpired lease on the same entity at the same
//! time. Every other guarantee (sequential transitions per entity, no lost
//! updates) follows from it.

pub mod command;
pub mod dispatch;
pub mod entity;
pub mod event;
pub mod lease;
pub mod manager;
pub mod retry;
pub mod store;

pub use command::{
    CommandEnvelope, CommandError, CommandHandler, CommandOutcome, CommandQueue, EntityCommand,
};
pub use dispatch::{DispatchError, RemoteMessage, RemoteMessageDispatcher, RemoteMessageDispatcherRegistry};
pub use entity::{EntityMeta, EntityState, StatefulEntity};
pub use event::{EventRouter, DEFAULT_EVENT_CAPACITY};
pub use lease::{Lease, LeaseRegistry};
pub use manager::{
    ManagerError, ManagerStatus, ProcessError, Processed, StateMachineManager,
    StateMachineManagerBuilder, StateProcessor, DEFAULT_BATCH_SIZE, DEFAULT_COMMAND_RETRY_LIMIT,
    DEFAULT_ITERATION_WAIT_MILLIS,
};
pub use retry::{EntitySendRetryManager, ExponentialWaitStrategy, FixedWaitStrategy, WaitStrategy};
pub use store::{EntityStore, InMemoryEntityStore, StoreError, DEFAULT_LEASE_DURATION_MILLIS};
