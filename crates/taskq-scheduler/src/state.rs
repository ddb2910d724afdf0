//! Task state machine.
//!
//! | From              | Event                    | To                 |
//! |-------------------|--------------------------|--------------------|
//! | PENDING, FAILED   | `Dispatched`             | ENQUEUED           |
//! | ENQUEUED          | `Started`                | STARTED            |
//! | STARTED           | `Succeeded`              | SUCCEEDED          |
//! | STARTED           | `Failed { exhausted }`   | FAILED / DEAD      |
//! | STARTED           | `TimedOut { exhausted }` | FAILED / DEAD      |
//! | ENQUEUED          | `Requeued`               | PENDING            |
//!
//! Every other pair is rejected with [`SchedulerError::InvalidTransition`].

use chrono::{DateTime, Utc};

use crate::backoff::Backoff;
use crate::error::{Result, SchedulerError};
use crate::store::{clamp_storable, latest_storable};
use crate::types::{DeadLetter, DeadLetterReason, FailureOutcome, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Handed to a lane by the dispatcher.
    Dispatched,
    /// A worker claimed the task.
    Started,
    /// The worker reported success.
    Succeeded,
    /// The worker reported a failure. `exhausted` when the bumped attempt
    /// count is past `max_retries`.
    Failed { exhausted: bool },
    /// The sweeper found the task STARTED for too long.
    TimedOut { exhausted: bool },
    /// The hand-off was lost (broker restarted) and the task goes back to PENDING.
    Requeued,
}

impl TaskEvent {
    /// States the event may fire from. Used as the guard of conditional updates.
    pub fn expected_from(&self) -> &'static [TaskStatus] {
        match self {
            TaskEvent::Dispatched => &[TaskStatus::Pending, TaskStatus::Failed],
            TaskEvent::Started | TaskEvent::Requeued => &[TaskStatus::Enqueued],
            TaskEvent::Succeeded | TaskEvent::Failed { .. } | TaskEvent::TimedOut { .. } => {
                &[TaskStatus::Started]
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Dispatched => "dispatched",
            TaskEvent::Started => "started",
            TaskEvent::Succeeded => "succeeded",
            TaskEvent::Failed { .. } => "failed",
            TaskEvent::TimedOut { .. } => "timed_out",
            TaskEvent::Requeued => "requeued",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TaskStatus {
    /// Look up the transition table.
    pub fn next(self, event: TaskEvent) -> Result<TaskStatus> {
        use TaskEvent as E;
        use TaskStatus as S;

        let to = match (self, event) {
            (S::Pending | S::Failed, E::Dispatched) => S::Enqueued,
            (S::Enqueued, E::Started) => S::Started,
            (S::Started, E::Succeeded) => S::Succeeded,
            (S::Started, E::Failed { exhausted } | E::TimedOut { exhausted }) => {
                if exhausted {
                    S::Dead
                } else {
                    S::Failed
                }
            }
            (S::Enqueued, E::Requeued) => S::Pending,
            (from, event) => return Err(SchedulerError::InvalidTransition { from, event }),
        };
        Ok(to)
    }
}

/// Why a STARTED task is being failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The payload raised an error.
    Execution(String),
    /// No result arrived before the stuck threshold.
    StuckTimeout,
}

/// `now + delay`, pinned to the last storable instant on overflow.
fn after(now: DateTime<Utc>, delay: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay)
        .map_or_else(latest_storable, clamp_storable)
}

impl Task {
    /// PENDING/FAILED → ENQUEUED. With `rearm`, a task that already failed
    /// gets `run_at` pushed forward as well.
    pub fn dispatched(&self, now: DateTime<Utc>, rearm: Option<&Backoff>) -> Result<Task> {
        let mut next = self.clone();
        next.status = self.status.next(TaskEvent::Dispatched)?;
        if let Some(backoff) = rearm {
            if self.attempts > 0 {
                next.run_at = after(now, backoff.delay(i64::from(self.attempts)));
            }
        }
        next.updated_at = now;
        Ok(next)
    }

    /// ENQUEUED → STARTED.
    pub fn started(&self, now: DateTime<Utc>) -> Result<Task> {
        let mut next = self.clone();
        next.status = self.status.next(TaskEvent::Started)?;
        next.started_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    /// STARTED → SUCCEEDED.
    pub fn succeeded(&self, now: DateTime<Utc>) -> Result<Task> {
        let mut next = self.clone();
        next.status = self.status.next(TaskEvent::Succeeded)?;
        next.finished_at = Some(now);
        next.last_error = None;
        next.updated_at = now;
        Ok(next)
    }

    /// STARTED → FAILED or DEAD.
    ///
    /// Bumps `attempts` by one. Past `max_retries` the task dies and the
    /// matching dead letter (not yet persisted, `id == 0`) is returned;
    /// otherwise `run_at` moves to `now + backoff(attempts)`.
    pub fn failed(
        &self,
        cause: FailureCause,
        now: DateTime<Utc>,
        backoff: &Backoff,
    ) -> Result<FailureOutcome> {
        let attempts = self.attempts.saturating_add(1);
        let exhausted = attempts > self.max_retries;

        let (event, error, reason) = match cause {
            FailureCause::Execution(msg) => (
                TaskEvent::Failed { exhausted },
                msg,
                DeadLetterReason::MaxRetriesExceeded,
            ),
            FailureCause::StuckTimeout => {
                let since = self
                    .started_at
                    .map(|t| crate::store::fmt_ts(&t))
                    .unwrap_or_else(|| "unknown".to_string());
                (
                    TaskEvent::TimedOut { exhausted },
                    format!("stuck task detected (started_at={since})"),
                    DeadLetterReason::StuckTaskTimeout,
                )
            }
        };

        let mut next = self.clone();
        next.status = self.status.next(event)?;
        next.attempts = attempts;
        next.last_error = Some(error.clone());
        next.finished_at = Some(now);
        next.updated_at = now;

        let dead_letter = if exhausted {
            Some(DeadLetter {
                id: 0,
                task_id: self.id.clone(),
                reason,
                error: Some(error),
                payload: self.payload.clone(),
                created_at: now,
            })
        } else {
            next.run_at = after(now, backoff.delay(i64::from(attempts)));
            None
        };

        Ok(FailureOutcome {
            task: next,
            dead_letter,
        })
    }

    /// ENQUEUED → PENDING. Attempts are untouched: nothing was executed.
    pub fn requeued(&self, now: DateTime<Utc>) -> Result<Task> {
        let mut next = self.clone();
        next.status = self.status.next(TaskEvent::Requeued)?;
        next.updated_at = now;
        Ok(next)
    }
}
