//! `taskq-scheduler` — durable deferred-task scheduling on SQLite.
//!
//! # Overview
//!
//! Tasks are persisted to a SQLite `tasks` table. The
//! [`engine::SchedulerEngine`] wakes on a fixed interval and, in order:
//!
//! 1. **sweeps** tasks stuck in `STARTED` past the stuck threshold back to
//!    `FAILED` (or `DEAD` once out of retries), and returns hand-offs left
//!    `ENQUEUED` as long to `PENDING`,
//! 2. **dispatches** due `PENDING`/`FAILED` tasks, highest priority first, to
//!    an execution lane and marks them `ENQUEUED`.
//!
//! Workers report results through [`repo::TaskRepository`]. Every write is
//! conditioned on the row's current status and attempt count, so late or
//! duplicate reports cannot resurrect a retired row.
//!
//! # Lanes
//!
//! | Priority | Lane      |
//! |----------|-----------|
//! | 8–10     | `high`    |
//! | 4–7      | `default` |
//! | 1–3      | `low`     |

pub mod backoff;
pub mod broker;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lane;
pub mod repo;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use backoff::{backoff_seconds, Backoff};
pub use broker::{Broker, BrokerError, BrokerReceivers, ChannelBroker};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use engine::{SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use lane::Lane;
pub use repo::TaskRepository;
pub use state::{FailureCause, TaskEvent};
pub use store::{wait_for_store, Store};
pub use sweeper::{SweepReport, Sweeper};
pub use types::{DeadLetter, DeadLetterReason, FailureOutcome, NewTask, Task, TaskStatus, Ticket};
pub use worker::{EchoHandler, Execution, ExecutionError, TaskHandler, WorkerPool};
