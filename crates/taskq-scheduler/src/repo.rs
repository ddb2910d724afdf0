use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use taskq_core::TaskId;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::error::{Result, SchedulerError};
use crate::state::{FailureCause, TaskEvent};
use crate::store::{fmt_ts, parse_ts, Store};
use crate::types::{DeadLetter, DeadLetterReason, FailureOutcome, NewTask, Task, TaskStatus, Ticket};

const TASK_COLUMNS: &str = "id, name, payload, status, priority, attempts, max_retries,
     run_at, last_error, created_at, updated_at, started_at, finished_at";

const DEAD_LETTER_COLUMNS: &str = "id, task_id, reason, error, payload, created_at";

/// Task and dead-letter persistence.
///
/// Single-row operations run in their own transaction. The multi-row scans
/// used by the dispatcher and sweeper are free functions taking the caller's
/// connection, so the whole read-mutate-commit unit stays in one transaction.
#[derive(Clone)]
pub struct TaskRepository {
    store: Store,
}

impl TaskRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Validate and insert a new task in PENDING.
    #[instrument(skip(self, new), fields(name = %new.name))]
    pub fn create(&self, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
        new.validate()?;
        let task = Task {
            id: TaskId::new(),
            name: new.name,
            payload: new.payload,
            status: TaskStatus::Pending,
            // Ranges checked by validate().
            priority: new.priority as u8,
            attempts: 0,
            max_retries: new.max_retries as u32,
            run_at: new.run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        let payload_json = serde_json::to_string(&task.payload)?;

        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO tasks
                 (id, name, payload, status, priority, attempts, max_retries,
                  run_at, last_error, created_at, updated_at, started_at, finished_at)
                 VALUES (?1,?2,?3,?4,?5,0,?6,?7,NULL,?8,?8,NULL,NULL)",
                rusqlite::params![
                    task.id.as_str(),
                    task.name,
                    payload_json,
                    task.status.as_str(),
                    task.priority,
                    task.max_retries,
                    fmt_ts(&task.run_at),
                    fmt_ts(&now),
                ],
            )?;
            Ok(())
        })?;

        info!(task_id = %task.id, priority = task.priority, "task created");
        Ok(task)
    }

    /// Point lookup. `None` if the id is unknown.
    pub fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        self.store.read(|conn| get_task(conn, id))
    }

    /// Dead letters recorded for `task_id` (at most one).
    pub fn dead_letters_for(&self, task_id: &TaskId) -> Result<Vec<DeadLetter>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
                 WHERE task_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map([task_id.as_str()], row_to_dead_letter)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// ENQUEUED → STARTED for a worker about to execute.
    ///
    /// Returns `None` when the row is not ENQUEUED (duplicate delivery, a
    /// hand-off whose dispatch never committed, or a task already retired).
    /// The worker must then skip execution.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn mark_started(&self, id: &TaskId, now: DateTime<Utc>) -> Result<Option<Ticket>> {
        self.store.write(|tx| {
            let Some(task) = get_task(tx, id)? else {
                warn!("claimed task does not exist");
                return Ok(None);
            };
            if task.status != TaskStatus::Enqueued {
                debug!(status = %task.status, "task not enqueued, skipping");
                return Ok(None);
            }
            let next = task.started(now)?;
            if !compare_and_swap(tx, &task, &next)? {
                return Ok(None);
            }
            Ok(Some(Ticket { task: next }))
        })
    }

    /// STARTED → SUCCEEDED. Returns `false` for a stale ticket.
    #[instrument(skip(self, ticket), fields(task_id = %ticket.task_id()))]
    pub fn mark_succeeded(&self, ticket: &Ticket, now: DateTime<Utc>) -> Result<bool> {
        self.store.write(|tx| {
            let Some(task) = current_for_ticket(tx, ticket)? else {
                return Ok(false);
            };
            let next = task.succeeded(now)?;
            let applied = compare_and_swap(tx, &task, &next)?;
            if applied {
                info!("task succeeded");
            }
            Ok(applied)
        })
    }

    /// STARTED → FAILED or DEAD after the payload raised `error`.
    ///
    /// A DEAD transition writes its dead letter in the same transaction.
    /// Returns `None` for a stale ticket, in which case nothing changed.
    #[instrument(skip(self, ticket, backoff), fields(task_id = %ticket.task_id()))]
    pub fn mark_failed(
        &self,
        ticket: &Ticket,
        error: &str,
        now: DateTime<Utc>,
        backoff: &Backoff,
    ) -> Result<Option<FailureOutcome>> {
        self.store.write(|tx| {
            let Some(task) = current_for_ticket(tx, ticket)? else {
                return Ok(None);
            };
            let outcome = apply_failure(
                tx,
                &task,
                FailureCause::Execution(error.to_string()),
                now,
                backoff,
            )?;
            Ok(outcome)
        })
    }

    /// Move every ENQUEUED row back to PENDING. Used at startup when the
    /// broker's queue did not survive the restart.
    #[instrument(skip(self))]
    pub fn requeue_enqueued(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.write(|tx| {
            let enqueued = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1"
                ))?;
                let rows = stmt.query_map([TaskStatus::Enqueued.as_str()], row_to_task)?;
                collect_readable(rows)?
            };

            let mut count = 0;
            for task in &enqueued {
                let next = task.requeued(now)?;
                if compare_and_swap(tx, task, &next)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }
}

/// Re-read the row behind `ticket` and confirm it is still the execution the
/// worker claimed: STARTED with the same attempt count.
fn current_for_ticket(conn: &Connection, ticket: &Ticket) -> Result<Option<Task>> {
    let Some(task) = get_task(conn, ticket.task_id())? else {
        warn!(task_id = %ticket.task_id(), "result for unknown task ignored");
        return Ok(None);
    };
    if task.status != TaskStatus::Started || task.attempts != ticket.attempts() {
        warn!(
            task_id = %task.id,
            status = %task.status,
            attempts = task.attempts,
            ticket_attempts = ticket.attempts(),
            "stale execution result ignored"
        );
        return Ok(None);
    }
    Ok(Some(task))
}

pub(crate) fn get_task(conn: &Connection, id: &TaskId) -> Result<Option<Task>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    Ok(stmt.query_row([id.as_str()], row_to_task).optional()?)
}

/// Tasks eligible for dispatch: PENDING or FAILED with `run_at <= now`.
///
/// Ordered by priority (highest first), then earliest `run_at`, then id.
pub fn select_due(conn: &Connection, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status IN ({}) AND run_at <= ?1
         ORDER BY priority DESC, run_at ASC, id ASC
         LIMIT ?2",
        status_list(TaskEvent::Dispatched.expected_from())
    ))?;
    let rows = stmt.query_map(rusqlite::params![fmt_ts(&now), limit], row_to_task)?;
    collect_readable(rows)
}

/// STARTED tasks whose `started_at` is at or before `cutoff`, oldest first.
pub fn select_stuck(conn: &Connection, cutoff: DateTime<Utc>, limit: u32) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = ?1 AND started_at IS NOT NULL AND started_at <= ?2
         ORDER BY started_at ASC, id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![TaskStatus::Started.as_str(), fmt_ts(&cutoff), limit],
        row_to_task,
    )?;
    collect_readable(rows)
}

/// ENQUEUED tasks handed off at or before `cutoff` that no worker claimed,
/// oldest first.
pub fn select_stale_enqueued(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE status = ?1 AND updated_at <= ?2
         ORDER BY updated_at ASC, id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![TaskStatus::Enqueued.as_str(), fmt_ts(&cutoff), limit],
        row_to_task,
    )?;
    collect_readable(rows)
}

/// Gather scanned rows. A row that no longer decodes is logged and skipped
/// so it cannot stall the rest of the page.
fn collect_readable(
    rows: impl Iterator<Item = rusqlite::Result<Task>>,
) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    for row in rows {
        match row {
            Ok(task) => tasks.push(task),
            Err(
                e @ (rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)),
            ) => error!(error = %e, "skipping unreadable task row"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(tasks)
}

/// Write `after` only if the row still looks like `before` (same status and
/// attempt count). Returns whether the row was updated.
pub fn compare_and_swap(conn: &Connection, before: &Task, after: &Task) -> Result<bool> {
    let n = conn.execute(
        "UPDATE tasks
         SET status = ?1, attempts = ?2, run_at = ?3, last_error = ?4,
             started_at = ?5, finished_at = ?6, updated_at = ?7
         WHERE id = ?8 AND status = ?9 AND attempts = ?10",
        rusqlite::params![
            after.status.as_str(),
            after.attempts,
            fmt_ts(&after.run_at),
            after.last_error,
            after.started_at.as_ref().map(fmt_ts),
            after.finished_at.as_ref().map(fmt_ts),
            fmt_ts(&after.updated_at),
            before.id.as_str(),
            before.status.as_str(),
            before.attempts,
        ],
    )?;
    if n == 0 {
        warn!(
            task_id = %before.id,
            expected = %before.status,
            "conditional update lost: row changed concurrently"
        );
    }
    Ok(n == 1)
}

/// Append a dead letter and fill in its row id.
pub fn insert_dead_letter(conn: &Connection, letter: &mut DeadLetter) -> Result<()> {
    conn.execute(
        "INSERT INTO dead_letters (task_id, reason, error, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            letter.task_id.as_str(),
            letter.reason.as_str(),
            letter.error,
            serde_json::to_string(&letter.payload)?,
            fmt_ts(&letter.created_at),
        ],
    )?;
    letter.id = conn.last_insert_rowid();
    Ok(())
}

/// Shared STARTED → FAILED/DEAD path for worker failures and stuck sweeps.
///
/// `None` means the conditional update lost a race and nothing was written.
pub(crate) fn apply_failure(
    conn: &Connection,
    task: &Task,
    cause: FailureCause,
    now: DateTime<Utc>,
    backoff: &Backoff,
) -> Result<Option<FailureOutcome>> {
    let mut outcome = task.failed(cause, now, backoff)?;
    if !compare_and_swap(conn, task, &outcome.task)? {
        return Ok(None);
    }
    if let Some(letter) = outcome.dead_letter.as_mut() {
        insert_dead_letter(conn, letter)?;
        warn!(
            task_id = %task.id,
            attempts = outcome.task.attempts,
            reason = %letter.reason,
            "task is dead"
        );
    } else {
        info!(
            task_id = %task.id,
            attempts = outcome.task.attempts,
            run_at = %fmt_ts(&outcome.task.run_at),
            "task failed, retry scheduled"
        );
    }
    Ok(Some(outcome))
}

fn status_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn corrupt(idx: usize, msg: String) -> rusqlite::Error {
    conversion_error(idx, SchedulerError::CorruptRow(msg))
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

/// Map a `TASK_COLUMNS` row to a `Task`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    Ok(Task {
        id: TaskId(row.get(0)?),
        name: row.get(1)?,
        payload: json_col(row, 2)?,
        status: status.parse().map_err(|e| corrupt(3, e))?,
        priority: row.get(4)?,
        attempts: row.get(5)?,
        max_retries: row.get(6)?,
        run_at: ts_col(row, 7)?,
        last_error: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
        started_at: opt_ts_col(row, 11)?,
        finished_at: opt_ts_col(row, 12)?,
    })
}

fn row_to_dead_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeadLetter> {
    let reason: String = row.get(2)?;
    Ok(DeadLetter {
        id: row.get(0)?,
        task_id: TaskId(row.get(1)?),
        reason: reason
            .parse::<DeadLetterReason>()
            .map_err(|e| corrupt(2, e))?,
        error: row.get(3)?,
        payload: json_col(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}
