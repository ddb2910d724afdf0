//! In-process execution side: drains lane channels and reports results back
//! through the repository's conditional transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use taskq_core::TaskId;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::error::Result;
use crate::lane::Lane;
use crate::repo::TaskRepository;
use crate::types::{Task, Ticket};

/// Claim tries per delivered id before the delivery is dropped. A dropped
/// id stays ENQUEUED until the sweeper hands it back to PENDING.
const CLAIM_ATTEMPTS: u32 = 5;
const CLAIM_RETRY_BASE: StdDuration = StdDuration::from_millis(50);

/// Failure raised by task business logic.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// Runs a task's payload. Implementations own the business logic.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task) -> std::result::Result<Value, ExecutionError>;
}

/// Default handler: echoes the payload back.
///
/// Two payload keys exist for exercising the retry machinery:
/// `sleep_sec` delays completion, `fail` makes the run fail.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, task: &Task) -> std::result::Result<Value, ExecutionError> {
        if let Some(secs) = task.payload.get("sleep_sec").and_then(Value::as_u64) {
            if secs > 0 {
                tokio::time::sleep(StdDuration::from_secs(secs)).await;
            }
        }
        if task.payload.get("fail").is_some_and(truthy) {
            return Err(ExecutionError(
                "Simulated failure requested by payload".to_string(),
            ));
        }
        Ok(json!({ "ok": true, "echo": task.payload }))
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// What happened to one delivered task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The row was not ENQUEUED; nothing ran.
    Skipped,
    Succeeded,
    /// Failed with retries left.
    Retrying,
    /// Failed and retired.
    Dead,
    /// Ran, but the row moved on (e.g. swept) before the result arrived.
    Stale,
}

/// Executes delivered tasks with bounded concurrency per lane.
pub struct WorkerPool {
    repo: TaskRepository,
    handler: Arc<dyn TaskHandler>,
    broker: Arc<dyn Broker>,
    backoff: Backoff,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(
        repo: TaskRepository,
        handler: Arc<dyn TaskHandler>,
        broker: Arc<dyn Broker>,
        backoff: Backoff,
        concurrency: usize,
    ) -> Self {
        Self {
            repo,
            handler,
            broker,
            backoff,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn one consumer per lane. Each finishes once its channel closes.
    pub fn spawn(
        self: Arc<Self>,
        lanes: HashMap<Lane, mpsc::Receiver<TaskId>>,
    ) -> Vec<JoinHandle<()>> {
        lanes
            .into_iter()
            .map(|(lane, rx)| {
                let pool = Arc::clone(&self);
                tokio::spawn(async move { pool.run_lane(lane, rx).await })
            })
            .collect()
    }

    async fn run_lane(self: Arc<Self>, lane: Lane, mut rx: mpsc::Receiver<TaskId>) {
        info!(%lane, concurrency = self.concurrency, "worker lane started");
        let permits = Arc::new(Semaphore::new(self.concurrency));

        while let Some(task_id) = rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                match pool.execute(&task_id).await {
                    Ok(outcome) => debug!(task_id = %task_id, %lane, ?outcome, "execution finished"),
                    Err(e) => error!(task_id = %task_id, %lane, "execution bookkeeping failed: {e}"),
                }
            });
        }
        info!(%lane, "worker lane closed");
    }

    /// Claim, run and report a single task.
    pub async fn execute(&self, task_id: &TaskId) -> Result<Execution> {
        let Some(ticket) = self.claim(task_id).await? else {
            return Ok(Execution::Skipped);
        };

        match self.handler.run(&ticket.task).await {
            Ok(_) => {
                if self.repo.mark_succeeded(&ticket, Utc::now())? {
                    Ok(Execution::Succeeded)
                } else {
                    Ok(Execution::Stale)
                }
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task execution failed");
                let outcome = self
                    .repo
                    .mark_failed(&ticket, &e.to_string(), Utc::now(), &self.backoff)?;
                match outcome {
                    None => Ok(Execution::Stale),
                    Some(outcome) => match outcome.dead_letter {
                        Some(letter) => {
                            if let Err(e) = self.broker.publish_dead_letter(&letter) {
                                warn!(task_id = %task_id, error = %e, "dead-letter publish failed");
                            }
                            Ok(Execution::Dead)
                        }
                        None => Ok(Execution::Retrying),
                    },
                }
            }
        }
    }

    /// ENQUEUED → STARTED, retried with exponential delay while the store
    /// errors (e.g. busy past its timeout).
    async fn claim(&self, task_id: &TaskId) -> Result<Option<Ticket>> {
        let mut attempt = 1;
        loop {
            match self.repo.mark_started(task_id, Utc::now()) {
                Ok(ticket) => return Ok(ticket),
                Err(e) if attempt < CLAIM_ATTEMPTS => {
                    let delay = CLAIM_RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(task_id = %task_id, attempt, error = %e, "claim failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
