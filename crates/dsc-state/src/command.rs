//! # Command Queue
//!
//! Commands are typed instructions that mutate one entity outside the
//! normal polling cycle: cancellations from an API caller, or results fed
//! back by an asynchronous continuation. The manager drains the queue once
//! per tick, before state polling, and applies each command to a freshly
//! loaded copy of its target.
//!
//! Validation happens at enqueue time. A command whose application fails
//! with a retryable error goes back to the end of the queue, up to a
//! configured number of times.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;

use crate::entity::StatefulEntity;
use crate::store::StoreError;

/// An instruction targeting one entity.
pub trait EntityCommand: std::fmt::Debug + Send + Sync + 'static {
    /// Id of the target entity.
    fn entity_id(&self) -> &str;

    /// Command name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Errors raised while enqueueing or applying a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command names no target entity.
    #[error("{command}: missing target entity id")]
    MissingTarget {
        /// Command name.
        command: &'static str,
    },

    /// The target entity does not exist.
    #[error("{command}: could not find {entity_type} with ID [{id}]")]
    NotFound {
        /// Command name.
        command: &'static str,
        /// Entity type name.
        entity_type: &'static str,
        /// Requested id.
        id: String,
    },

    /// The handler refused the command in the entity's current state.
    #[error("{command}: {reason}")]
    Rejected {
        /// Command name.
        command: &'static str,
        /// Reason.
        reason: String,
    },

    /// Persisting the modified entity failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CommandError {
    /// Whether re-applying the command later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result of applying a command to an entity.
#[derive(Debug)]
pub enum CommandOutcome<T: StatefulEntity> {
    /// The entity changed and must be saved; events are published after
    /// the save succeeds.
    Modified {
        /// The modified copy.
        entity: T,
        /// Events to publish.
        events: Vec<T::Event>,
    },
    /// Nothing to do.
    Unchanged,
}

impl<T: StatefulEntity> CommandOutcome<T> {
    /// A modification without events.
    pub fn modified(entity: T) -> Self {
        Self::Modified {
            entity,
            events: Vec::new(),
        }
    }
}

/// Applies commands of type `C` to entities of type `T`.
pub trait CommandHandler<T: StatefulEntity, C>: Send + Sync {
    /// Apply `command` to a freshly loaded `entity`.
    fn handle(&self, command: &C, entity: T) -> Result<CommandOutcome<T>, CommandError>;
}

/// A queued command and how often its application has failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope<C> {
    /// The command.
    pub command: C,
    /// Failed application attempts so far.
    pub error_count: u32,
}

/// FIFO queue of pending commands, shared between producers and one manager.
#[derive(Debug)]
pub struct CommandQueue<C> {
    queue: Mutex<VecDeque<CommandEnvelope<C>>>,
}

impl<C> Default for CommandQueue<C> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<C: EntityCommand> CommandQueue<C> {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a command.
    pub fn enqueue(&self, command: C) -> Result<(), CommandError> {
        if command.entity_id().trim().is_empty() {
            return Err(CommandError::MissingTarget {
                command: command.name(),
            });
        }
        self.queue.lock().push_back(CommandEnvelope {
            command,
            error_count: 0,
        });
        Ok(())
    }

    /// Put back a command whose application failed.
    pub fn requeue(&self, mut envelope: CommandEnvelope<C>) {
        envelope.error_count += 1;
        self.queue.lock().push_back(envelope);
    }

    /// Remove and return up to `max` commands in FIFO order.
    pub fn dequeue(&self, max: usize) -> Vec<CommandEnvelope<C>> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Number of pending commands.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no commands are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
