// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use taskq_core::TaskId;
use taskq_scheduler::{Broker, BrokerError, DeadLetter, Lane, NewTask, Store, Task, TaskRepository};

/// Records every hand-off; refuses ids listed in `refuse`.
#[derive(Default)]
pub struct RecordingBroker {
    pub sent: Mutex<Vec<(Lane, TaskId)>>,
    pub dead: Mutex<Vec<DeadLetter>>,
    pub refuse: Mutex<HashSet<TaskId>>,
}

impl RecordingBroker {
    pub fn sent_ids(&self) -> Vec<TaskId> {
        self.sent.lock().unwrap().iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn refuse(&self, id: &TaskId) {
        self.refuse.lock().unwrap().insert(id.clone());
    }

    pub fn accept_all(&self) {
        self.refuse.lock().unwrap().clear();
    }
}

impl Broker for RecordingBroker {
    fn enqueue(&self, lane: Lane, task_id: &TaskId) -> Result<(), BrokerError> {
        if self.refuse.lock().unwrap().contains(task_id) {
            return Err(BrokerError::LaneClosed {
                lane: lane.to_string(),
            });
        }
        self.sent.lock().unwrap().push((lane, task_id.clone()));
        Ok(())
    }

    fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), BrokerError> {
        self.dead.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn repo() -> TaskRepository {
    TaskRepository::new(Store::open_in_memory().unwrap())
}

pub fn create(repo: &TaskRepository, name: &str, priority: i64, run_at: DateTime<Utc>) -> Task {
    repo.create(NewTask::new(name, run_at).with_priority(priority), run_at)
        .unwrap()
}

pub fn reload(repo: &TaskRepository, task: &Task) -> Task {
    repo.get(&task.id).unwrap().expect("task exists")
}
