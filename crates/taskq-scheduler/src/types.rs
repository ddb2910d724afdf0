use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskq_core::TaskId;

use crate::error::{Result, SchedulerError};
use crate::store::is_storable;

pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 10;
pub const MAX_RETRIES_LIMIT: i64 = 20;
pub const MAX_NAME_LEN: usize = 120;

/// Lifecycle state of a task.
///
/// SUCCEEDED and DEAD are terminal. FAILED means "waiting for retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, waiting for `run_at`.
    Pending,
    /// Handed to a lane, not yet picked up by a worker.
    Enqueued,
    /// A worker claimed it and is executing the payload.
    Started,
    /// Finished successfully.
    Succeeded,
    /// Last execution failed or got stuck; eligible again once `run_at` passes.
    Failed,
    /// Retry budget exhausted. A dead letter exists for it.
    Dead,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Enqueued,
        TaskStatus::Started,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Enqueued => "ENQUEUED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Dead)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "ENQUEUED" => Ok(TaskStatus::Enqueued),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            "DEAD" => Ok(TaskStatus::Dead),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUID v7 string — primary key.
    pub id: TaskId,
    /// Free-form label. Not used for routing.
    pub name: String,
    /// Opaque JSON handed to the executor untouched.
    pub payload: Value,
    pub status: TaskStatus,
    /// 1..=10, higher is more urgent.
    pub priority: u8,
    /// Failed or stuck executions so far. Never decreases.
    pub attempts: u32,
    pub max_retries: u32,
    /// Not eligible for dispatch before this instant.
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Request body for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub run_at: DateTime<Utc>,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}
fn default_priority() -> i64 {
    5
}
fn default_max_retries() -> i64 {
    3
}

impl NewTask {
    /// Convenience constructor with the API defaults (priority 5, 3 retries, empty payload).
    pub fn new(name: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            payload: empty_object(),
            priority: default_priority(),
            run_at,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Check field ranges. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SchedulerError::InvalidTask("name must not be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(SchedulerError::InvalidTask(format!(
                "name longer than {MAX_NAME_LEN} characters"
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::InvalidTask(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                self.priority
            )));
        }
        if !(0..=MAX_RETRIES_LIMIT).contains(&self.max_retries) {
            return Err(SchedulerError::InvalidTask(format!(
                "max_retries must be between 0 and {MAX_RETRIES_LIMIT}, got {}",
                self.max_retries
            )));
        }
        if !is_storable(&self.run_at) {
            return Err(SchedulerError::InvalidTask(
                "run_at must fall between years 0000 and 9999".into(),
            ));
        }
        if !self.payload.is_object() {
            return Err(SchedulerError::InvalidTask(
                "payload must be a JSON object".into(),
            ));
        }
        Ok(())
    }
}

/// Why a task was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    StuckTaskTimeout,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MaxRetriesExceeded => "max_retries_exceeded",
            DeadLetterReason::StuckTaskTimeout => "stuck_task_timeout",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "max_retries_exceeded" => Ok(DeadLetterReason::MaxRetriesExceeded),
            "stuck_task_timeout" => Ok(DeadLetterReason::StuckTaskTimeout),
            other => Err(format!("unknown dead letter reason: {other}")),
        }
    }
}

/// Immutable audit record for a task that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Row id; `0` until the record has been persisted.
    pub id: i64,
    pub task_id: TaskId,
    pub reason: DeadLetterReason,
    pub error: Option<String>,
    /// Payload as it was when the task died.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Proof that a worker claimed a task. The `attempts` value observed at claim
/// time fences result reports: once a sweep bumps the counter, reports
/// carrying the old value are rejected.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub task: Task,
}

impl Ticket {
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn attempts(&self) -> u32 {
        self.task.attempts
    }
}

/// Result of recording a failed execution or a stuck timeout.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub task: Task,
    /// Present only when the failure retired the task.
    pub dead_letter: Option<DeadLetter>,
}

impl FailureOutcome {
    pub fn is_dead(&self) -> bool {
        self.dead_letter.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_text() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&TaskStatus::Enqueued).unwrap();
        assert_eq!(json, r#""ENQUEUED""#);
    }

    #[test]
    fn new_task_applies_api_defaults() {
        let body = json!({ "name": "report", "run_at": "2026-01-01T00:00:00Z" });
        let task: NewTask = serde_json::from_value(body).unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.payload, json!({}));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let base = NewTask::new("t", Utc::now());
        assert!(base.clone().with_priority(0).validate().is_err());
        assert!(base.clone().with_priority(11).validate().is_err());
        assert!(base.clone().with_max_retries(-1).validate().is_err());
        assert!(base.clone().with_max_retries(21).validate().is_err());
        assert!(base.clone().with_payload(json!([1, 2])).validate().is_err());
        assert!(NewTask::new("   ", Utc::now()).validate().is_err());
        assert!(NewTask::new("x".repeat(121), Utc::now()).validate().is_err());

        assert!(base.clone().with_priority(1).validate().is_ok());
        assert!(base.clone().with_priority(10).validate().is_ok());
        assert!(base.with_max_retries(20).validate().is_ok());
    }

    #[test]
    fn validate_rejects_run_at_outside_four_digit_years() {
        let body = json!({ "name": "far", "run_at": "+10000-01-01T00:00:00Z" });
        let task: NewTask = serde_json::from_value(body).unwrap();
        assert!(matches!(task.validate(), Err(SchedulerError::InvalidTask(_))));

        assert!(NewTask::new("t", DateTime::<Utc>::MAX_UTC).validate().is_err());
        assert!(NewTask::new("t", DateTime::<Utc>::MIN_UTC).validate().is_err());
        assert!(NewTask::new("t", crate::store::latest_storable())
            .validate()
            .is_ok());
    }

    #[test]
    fn dead_letter_reason_tags() {
        assert_eq!(
            DeadLetterReason::MaxRetriesExceeded.to_string(),
            "max_retries_exceeded"
        );
        assert_eq!(
            "stuck_task_timeout".parse::<DeadLetterReason>().unwrap(),
            DeadLetterReason::StuckTaskTimeout
        );
    }
}
