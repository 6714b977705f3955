//! # State-Machine Manager
//!
//! The generic polling loop shared by every entity manager.
//!
//! ## Tick
//!
//! 1. Drain the command queue. Each command is applied to a freshly loaded
//!    entity; a modified entity is saved, then its events are published.
//! 2. For each state with a registered processor, lease up to `batch_size`
//!    entities in that state (oldest first) and hand each one to the
//!    processor.
//! 3. Act on the processor's [`Processed`] outcome: save and publish,
//!    release the lease, requeue behind the entity's peers, or leave the
//!    lease with an in-flight continuation.
//!
//! A processor error or panic affects only its entity: the entity moves to
//! its error state with the failure message as `error_detail`, and the batch
//! continues. Events are published strictly after a successful save.
//!
//! ## Loop
//!
//! [`StateMachineManager::start`] spawns the loop on the current Tokio
//! runtime. A tick that did work is followed immediately by another; an
//! idle tick sleeps for [`WaitStrategy::wait_for_millis`]. `start` is
//! idempotent, and [`StateMachineManager::stop`] signals the loop and waits
//! for it to finish its current tick.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use dsc_core::{Clock, StateError, SystemClock};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::command::{CommandEnvelope, CommandError, CommandHandler, CommandOutcome, CommandQueue, EntityCommand};
use crate::entity::{EntityState, StatefulEntity};
use crate::event::EventRouter;
use crate::retry::{FixedWaitStrategy, WaitStrategy};
use crate::store::EntityStore;

/// Default number of entities leased per state per tick.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default number of times a failing command is re-queued.
pub const DEFAULT_COMMAND_RETRY_LIMIT: u32 = 3;

/// Default idle poll interval.
pub const DEFAULT_ITERATION_WAIT_MILLIS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Processor contract
// ---------------------------------------------------------------------------

/// Outcome of processing one leased entity.
#[derive(Debug)]
pub enum Processed<T: StatefulEntity> {
    /// The entity changed state (or re-entered its state). It is saved, then
    /// `events` are published.
    Transitioned {
        /// The new value.
        entity: T,
        /// Events to publish after the save.
        events: Vec<T::Event>,
    },
    /// Nothing to do yet. The lease is released and the entity is left
    /// untouched, so it keeps its place at the front of the queue. Used
    /// while a retry backoff runs, which is measured from `state_timestamp`.
    Unchanged(T),
    /// Still waiting on an external condition. The entity is saved with a
    /// fresh `state_timestamp` (its `state_count` is kept), which sends it
    /// to the back of the queue for its state.
    Requeued(T),
    /// An asynchronous continuation now owns the entity. The lease is kept
    /// and the continuation reports back through the command queue.
    InFlight,
}

impl<T: StatefulEntity> Processed<T> {
    /// A transition without events.
    pub fn transitioned(entity: T) -> Self {
        Self::Transitioned {
            entity,
            events: Vec::new(),
        }
    }

    /// A transition with one event.
    pub fn with_event(entity: T, event: T::Event) -> Self {
        Self::Transitioned {
            entity,
            events: vec![event],
        }
    }
}

/// Failure inside a state processor. The entity is moved to its error
/// state with this error's message as detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// An attempted transition was rejected.
    #[error(transparent)]
    State(#[from] StateError),

    /// The step failed permanently.
    #[error("{0}")]
    Fatal(String),
}

/// Handles entities in one state.
pub trait StateProcessor<T: StatefulEntity>: Send + Sync {
    /// Process one leased entity.
    fn process(&self, entity: T) -> Result<Processed<T>, ProcessError>;
}

impl<T, F> StateProcessor<T> for F
where
    T: StatefulEntity,
    F: Fn(T) -> Result<Processed<T>, ProcessError> + Send + Sync,
{
    fn process(&self, entity: T) -> Result<Processed<T>, ProcessError> {
        self(entity)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerStatus {
    /// Built, never started.
    Empty,
    /// Polling loop running.
    Started,
    /// Polling loop stopped.
    Stopped,
}

impl std::fmt::Display for ManagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Empty => "EMPTY",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Errors raised while building or running a manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// A required builder component was not supplied.
    #[error("manager '{manager}' is missing its {component}")]
    MissingComponent {
        /// Manager name.
        manager: String,
        /// Missing component.
        component: &'static str,
    },

    /// The batch size must be at least 1.
    #[error("manager '{0}': batch size must be greater than 0")]
    InvalidBatchSize(String),

    /// `start` was called outside a Tokio runtime.
    #[error("manager '{0}' can only be started inside a Tokio runtime")]
    NoRuntime(String),

    /// The polling task ended abnormally.
    #[error("manager '{manager}' loop failed: {reason}")]
    LoopFailed {
        /// Manager name.
        manager: String,
        /// Join error message.
        reason: String,
    },
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// StateMachineManager
// ---------------------------------------------------------------------------

/// Generic polling manager for one entity type and its command type.
pub struct StateMachineManager<T: StatefulEntity, C: EntityCommand> {
    name: String,
    store: Arc<dyn EntityStore<T>>,
    processors: Vec<(T::State, Arc<dyn StateProcessor<T>>)>,
    commands: Arc<CommandQueue<C>>,
    command_handler: Arc<dyn CommandHandler<T, C>>,
    events: EventRouter<T::Event>,
    wait_strategy: Arc<dyn WaitStrategy>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    command_retry_limit: u32,
    status: Mutex<ManagerStatus>,
    running: Mutex<Option<LoopHandle>>,
}

impl<T: StatefulEntity, C: EntityCommand> std::fmt::Debug for StateMachineManager<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineManager")
            .field("name", &self.name)
            .field("entity_type", &T::TYPE_NAME)
            .field(
                "states",
                &self.processors.iter().map(|(s, _)| s.to_string()).collect::<Vec<_>>(),
            )
            .field("batch_size", &self.batch_size)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl<T: StatefulEntity, C: EntityCommand> StateMachineManager<T, C> {
    /// Start building a manager called `name`.
    pub fn builder(name: impl Into<String>) -> StateMachineManagerBuilder<T, C> {
        StateMachineManagerBuilder::new(name)
    }

    /// Manager name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ManagerStatus {
        *self.status.lock()
    }

    /// The command queue this manager drains.
    pub fn commands(&self) -> &Arc<CommandQueue<C>> {
        &self.commands
    }

    /// The router lifecycle events are published on.
    pub fn events(&self) -> &EventRouter<T::Event> {
        &self.events
    }

    /// The store this manager polls.
    pub fn store(&self) -> &Arc<dyn EntityStore<T>> {
        &self.store
    }

    /// Spawn the polling loop on the current Tokio runtime. Calling `start`
    /// on a running manager does nothing.
    pub fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut status = self.status.lock();
        if *status == ManagerStatus::Started {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ManagerError::NoRuntime(self.name.clone()))?;
        let (shutdown, signal) = watch::channel(false);
        let manager = Arc::clone(self);
        let task = runtime.spawn(async move { manager.run(signal).await });
        *self.running.lock() = Some(LoopHandle { shutdown, task });
        *status = ManagerStatus::Started;
        tracing::info!(manager = %self.name, "state machine manager started");
        Ok(())
    }

    /// Signal the polling loop to stop and wait for it to exit.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let handle = self.running.lock().take();
        let result = match handle {
            Some(LoopHandle { shutdown, task }) => {
                // The loop may already have exited, in which case there is no
                // receiver left to notify.
                let _ = shutdown.send(true);
                task.await.map_err(|e| ManagerError::LoopFailed {
                    manager: self.name.clone(),
                    reason: e.to_string(),
                })
            }
            None => Ok(()),
        };
        *self.status.lock() = ManagerStatus::Stopped;
        tracing::info!(manager = %self.name, "state machine manager stopped");
        result
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let work = self.tick();
            if work > 0 {
                self.wait_strategy.success();
                tokio::task::yield_now().await;
                continue;
            }
            let delay = Duration::from_millis(self.wait_strategy.wait_for_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Run one iteration: drain commands, then process every registered
    /// state once. Returns the number of units of work performed.
    pub fn tick(&self) -> usize {
        let applied = self.apply_commands();
        let mut processed = 0;
        for (state, processor) in &self.processors {
            let batch = match self.store.next_for_state(state.code(), self.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(manager = %self.name, state = %state, error = %e, "failed to fetch entities");
                    continue;
                }
            };
            for entity in batch {
                if self.process_one(*state, processor.as_ref(), entity) {
                    processed += 1;
                }
            }
        }
        applied + processed
    }

    fn process_one(&self, state: T::State, processor: &dyn StateProcessor<T>, entity: T) -> bool {
        let id = entity.id().to_string();
        let state_count = entity.meta().state_count;
        let original = entity.clone();

        let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(entity)));
        match outcome {
            Ok(Ok(Processed::Transitioned { entity, events })) => {
                tracing::debug!(
                    manager = %self.name,
                    entity_id = %id,
                    state = %state,
                    state_count,
                    "entity transitioned"
                );
                self.persist(entity, events)
            }
            Ok(Ok(Processed::Unchanged(_))) => {
                if let Err(e) = self.store.break_lease(&id) {
                    tracing::warn!(manager = %self.name, entity_id = %id, error = %e, "failed to release lease");
                }
                false
            }
            Ok(Ok(Processed::Requeued(entity))) => {
                self.requeue(entity);
                false
            }
            Ok(Ok(Processed::InFlight)) => {
                tracing::debug!(manager = %self.name, entity_id = %id, state = %state, "step in flight");
                true
            }
            Ok(Err(e)) => self.fail(original, e.to_string()),
            Err(panic) => self.fail(original, panic_message(panic.as_ref())),
        }
    }

    fn fail(&self, entity: T, detail: String) -> bool {
        tracing::error!(
            manager = %self.name,
            entity_id = %entity.id(),
            state_count = entity.meta().state_count,
            error = %detail,
            "processing failed, moving entity to error state"
        );
        metrics::counter!("dsc_state_machine_errors_total", "manager" => self.name.clone()).increment(1);
        let failed = entity.into_error(detail, self.clock.now_millis());
        let event = failed.failure_event();
        self.persist(failed, vec![event])
    }

    fn requeue(&self, mut entity: T) {
        let id = entity.id().to_string();
        entity.meta_mut().touch(self.clock.now_millis());
        if let Err(e) = self.store.save(entity) {
            tracing::warn!(manager = %self.name, entity_id = %id, error = %e, "failed to requeue entity");
            if let Err(e) = self.store.break_lease(&id) {
                tracing::warn!(manager = %self.name, entity_id = %id, error = %e, "failed to release lease");
            }
        }
    }

    fn persist(&self, entity: T, events: Vec<T::Event>) -> bool {
        let id = entity.id().to_string();
        match self.store.save(entity) {
            Ok(()) => {
                metrics::counter!("dsc_state_machine_processed_total", "manager" => self.name.clone())
                    .increment(1);
                for event in events {
                    self.events.publish(event);
                }
                true
            }
            Err(e) => {
                tracing::error!(manager = %self.name, entity_id = %id, error = %e, "failed to persist entity");
                false
            }
        }
    }

    fn apply_commands(&self) -> usize {
        let pending = self.commands.len();
        let mut applied = 0;
        for envelope in self.commands.dequeue(pending) {
            let name = envelope.command.name();
            let id = envelope.command.entity_id().to_string();
            match self.apply_command(&envelope) {
                Ok(true) => {
                    applied += 1;
                    metrics::counter!("dsc_commands_applied_total", "manager" => self.name.clone())
                        .increment(1);
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() && envelope.error_count < self.command_retry_limit => {
                    tracing::warn!(
                        manager = %self.name,
                        command = name,
                        entity_id = %id,
                        attempt = envelope.error_count + 1,
                        error = %e,
                        "command failed, re-queueing"
                    );
                    self.commands.requeue(envelope);
                }
                Err(e) => {
                    tracing::error!(
                        manager = %self.name,
                        command = name,
                        entity_id = %id,
                        error = %e,
                        "command dropped"
                    );
                }
            }
        }
        applied
    }

    fn apply_command(&self, envelope: &CommandEnvelope<C>) -> Result<bool, CommandError> {
        let command = &envelope.command;
        let entity = self
            .store
            .find(command.entity_id())?
            .ok_or_else(|| CommandError::NotFound {
                command: command.name(),
                entity_type: T::TYPE_NAME,
                id: command.entity_id().to_string(),
            })?;

        let outcome = catch_unwind(AssertUnwindSafe(|| self.command_handler.handle(command, entity)))
            .map_err(|panic| CommandError::Rejected {
                command: command.name(),
                reason: panic_message(panic.as_ref()),
            })??;

        match outcome {
            CommandOutcome::Modified { entity, events } => {
                self.store.save(entity)?;
                for event in events {
                    self.events.publish(event);
                }
                Ok(true)
            }
            CommandOutcome::Unchanged => Ok(false),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "processor panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`StateMachineManager`].
pub struct StateMachineManagerBuilder<T: StatefulEntity, C: EntityCommand> {
    name: String,
    store: Option<Arc<dyn EntityStore<T>>>,
    processors: Vec<(T::State, Arc<dyn StateProcessor<T>>)>,
    commands: Option<Arc<CommandQueue<C>>>,
    command_handler: Option<Arc<dyn CommandHandler<T, C>>>,
    events: Option<EventRouter<T::Event>>,
    wait_strategy: Option<Arc<dyn WaitStrategy>>,
    clock: Option<Arc<dyn Clock>>,
    batch_size: usize,
    command_retry_limit: u32,
}

impl<T: StatefulEntity, C: EntityCommand> StateMachineManagerBuilder<T, C> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: None,
            processors: Vec::new(),
            commands: None,
            command_handler: None,
            events: None,
            wait_strategy: None,
            clock: None,
            batch_size: DEFAULT_BATCH_SIZE,
            command_retry_limit: DEFAULT_COMMAND_RETRY_LIMIT,
        }
    }

    /// The store to poll.
    pub fn store(mut self, store: Arc<dyn EntityStore<T>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handle entities in `state` with `processor`. States are processed in
    /// registration order.
    pub fn processor(mut self, state: T::State, processor: impl StateProcessor<T> + 'static) -> Self {
        self.processors.push((state, Arc::new(processor)));
        self
    }

    /// Share an existing command queue. A fresh one is created otherwise.
    pub fn command_queue(mut self, queue: Arc<CommandQueue<C>>) -> Self {
        self.commands = Some(queue);
        self
    }

    /// The handler commands are applied with.
    pub fn command_handler(mut self, handler: Arc<dyn CommandHandler<T, C>>) -> Self {
        self.command_handler = Some(handler);
        self
    }

    /// Share an existing event router. A fresh one is created otherwise.
    pub fn events(mut self, events: EventRouter<T::Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Poll backoff. Defaults to a fixed one-second interval.
    pub fn wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = Some(strategy);
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Entities leased per state per tick.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// How often a retryable command failure is re-queued.
    pub fn command_retry_limit(mut self, limit: u32) -> Self {
        self.command_retry_limit = limit;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<StateMachineManager<T, C>, ManagerError> {
        let missing = |component| ManagerError::MissingComponent {
            manager: self.name.clone(),
            component,
        };
        let store = self.store.clone().ok_or_else(|| missing("store"))?;
        let command_handler = self
            .command_handler
            .clone()
            .ok_or_else(|| missing("command handler"))?;
        if self.batch_size == 0 {
            return Err(ManagerError::InvalidBatchSize(self.name));
        }
        Ok(StateMachineManager {
            store,
            processors: self.processors,
            commands: self.commands.unwrap_or_default(),
            command_handler,
            events: self.events.unwrap_or_default(),
            wait_strategy: self
                .wait_strategy
                .unwrap_or_else(|| Arc::new(FixedWaitStrategy::new(DEFAULT_ITERATION_WAIT_MILLIS))),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            batch_size: self.batch_size,
            command_retry_limit: self.command_retry_limit,
            status: Mutex::new(ManagerStatus::Empty),
            running: Mutex::new(None),
            name: self.name,
        })
    }
}
