use thiserror::Error;

use crate::broker::BrokerError;
use crate::state::TaskEvent;
use crate::types::TaskStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store never became reachable during startup.
    #[error("Store not ready after {waited_secs}s: {last_error}")]
    StoreUnavailable { waited_secs: u64, last_error: String },

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// The state machine has no edge for this (state, event) pair.
    #[error("Invalid transition: {event} from {from}")]
    InvalidTransition { from: TaskStatus, event: TaskEvent },

    /// A task definition was rejected before it reached the store.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// The worker pool refused a hand-off.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row could not be decoded.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// A thread panicked while holding the store connection.
    #[error("Store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
