mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{create, reload, repo, ts, RecordingBroker};
use taskq_core::config::SchedulerConfig;
use taskq_scheduler::{
    Backoff, DeadLetterReason, Dispatcher, NewTask, SchedulerEngine, SweepReport, Sweeper, Task,
    TaskRepository, TaskStatus,
};

const STUCK_AFTER: i64 = 180;

fn sweeper(repo: &TaskRepository, broker: &Arc<RecordingBroker>) -> Sweeper {
    Sweeper::new(
        repo.store().clone(),
        broker.clone(),
        Duration::seconds(STUCK_AFTER),
        200,
        Backoff::default(),
    )
}

/// Create a task, dispatch it and have a worker claim it at `started`.
fn started_task(
    repo: &TaskRepository,
    broker: &Arc<RecordingBroker>,
    max_retries: i64,
    started: chrono::DateTime<chrono::Utc>,
) -> Task {
    let run_at = started - Duration::seconds(10);
    let task = repo
        .create(NewTask::new("job", run_at).with_max_retries(max_retries), run_at)
        .unwrap();
    Dispatcher::new(repo.store().clone(), broker.clone(), 200)
        .dispatch(run_at)
        .unwrap();
    repo.mark_started(&task.id, started).unwrap().unwrap();
    reload(repo, &task)
}

#[test]
fn stuck_task_is_failed_with_backoff() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = started_task(&repo, &broker, 3, t);
    let sweeper = sweeper(&repo, &broker);

    // Not stuck yet.
    let report = sweeper.sweep(t + Duration::seconds(179)).unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(reload(&repo, &task).status, TaskStatus::Started);

    let now = t + Duration::seconds(181);
    let report = sweeper.sweep(now).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.dead, 0);

    let swept = reload(&repo, &task);
    assert_eq!(swept.status, TaskStatus::Failed);
    assert_eq!(swept.attempts, 1);
    assert!(swept.run_at >= now + Duration::seconds(2));
    assert!(swept.last_error.unwrap().starts_with("stuck"));
    assert!(broker.dead.lock().unwrap().is_empty());
}

#[test]
fn sweep_is_idempotent_without_new_stuck_tasks() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = started_task(&repo, &broker, 3, t);
    let sweeper = sweeper(&repo, &broker);

    let now = t + Duration::seconds(200);
    sweeper.sweep(now).unwrap();
    let after_first = reload(&repo, &task);

    let report = sweeper.sweep(now).unwrap();
    assert_eq!(report, Default::default());
    assert_eq!(reload(&repo, &task), after_first);
}

#[test]
fn stuck_task_out_of_retries_dies_once() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = started_task(&repo, &broker, 0, t);
    let sweeper = sweeper(&repo, &broker);

    let report = sweeper.sweep(t + Duration::seconds(300)).unwrap();
    assert_eq!(report.dead, 1);

    let dead = reload(&repo, &task);
    assert_eq!(dead.status, TaskStatus::Dead);
    assert_eq!(dead.attempts, 1);
    assert!(dead.attempts > dead.max_retries);
    assert!(dead.finished_at.is_some());

    let letters = repo.dead_letters_for(&task.id).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::StuckTaskTimeout);
    assert!(letters[0].id > 0);

    let published = broker.dead.lock().unwrap().clone();
    assert_eq!(published, letters);

    // Nothing more to do on later sweeps.
    sweeper.sweep(t + Duration::seconds(900)).unwrap();
    assert_eq!(repo.dead_letters_for(&task.id).unwrap().len(), 1);
}

#[test]
fn oldest_stuck_tasks_are_swept_first_within_page() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let newer = started_task(&repo, &broker, 3, t + Duration::seconds(5));
    let older = started_task(&repo, &broker, 3, t);

    let sweeper = Sweeper::new(
        repo.store().clone(),
        broker.clone(),
        Duration::seconds(STUCK_AFTER),
        1,
        Backoff::default(),
    );
    sweeper.sweep(t + Duration::seconds(400)).unwrap();
    assert_eq!(reload(&repo, &older).status, TaskStatus::Failed);
    assert_eq!(reload(&repo, &newer).status, TaskStatus::Started);
}

#[test]
fn late_result_cannot_resurrect_swept_task() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = started_task(&repo, &broker, 3, t);
    // The worker's claim from started_task; re-read to get a ticket-equivalent.
    let old_ticket = taskq_scheduler::Ticket {
        task: reload(&repo, &task),
    };

    let now = t + Duration::seconds(181);
    sweeper(&repo, &broker).sweep(now).unwrap();

    // The original execution finally reports.
    assert!(!repo.mark_succeeded(&old_ticket, now).unwrap());
    assert_eq!(reload(&repo, &task).status, TaskStatus::Failed);

    // Redispatch and claim again; the stale ticket still cannot touch the row.
    let due = reload(&repo, &task).run_at;
    Dispatcher::new(repo.store().clone(), broker.clone(), 200)
        .dispatch(due)
        .unwrap();
    let fresh_ticket = repo.mark_started(&task.id, due).unwrap().unwrap();
    assert_eq!(fresh_ticket.attempts(), 1);

    assert!(repo
        .mark_failed(&old_ticket, "late failure", due, &Backoff::default())
        .unwrap()
        .is_none());
    assert_eq!(reload(&repo, &task).status, TaskStatus::Started);

    assert!(repo.mark_succeeded(&fresh_ticket, due).unwrap());
    let done = reload(&repo, &task);
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert!(done.last_error.is_none());
    assert_eq!(done.attempts, 1);
}

#[test]
fn unclaimed_handoff_returns_to_pending() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = create(&repo, "orphan", 5, t);
    let dispatcher = Dispatcher::new(repo.store().clone(), broker.clone(), 200);
    dispatcher.dispatch(t).unwrap();
    assert_eq!(reload(&repo, &task).status, TaskStatus::Enqueued);

    let sweeper = sweeper(&repo, &broker);
    let report = sweeper.sweep(t + Duration::seconds(179)).unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(reload(&repo, &task).status, TaskStatus::Enqueued);

    let now = t + Duration::seconds(181);
    let report = sweeper.sweep(now).unwrap();
    assert_eq!(report.requeued, 1);
    let row = reload(&repo, &task);
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.attempts, 0);

    // Eligible again; the old and new deliveries claim it only once.
    assert_eq!(dispatcher.dispatch(now).unwrap().dispatched, 1);
    assert_eq!(broker.sent_ids(), vec![task.id.clone(), task.id.clone()]);
    assert!(repo.mark_started(&task.id, now).unwrap().is_some());
    assert!(repo.mark_started(&task.id, now).unwrap().is_none());
}

#[test]
fn oversized_stuck_threshold_never_sweeps() {
    let repo = repo();
    let broker = Arc::new(RecordingBroker::default());
    let t = ts("2026-05-01T10:00:00Z");
    let task = started_task(&repo, &broker, 3, t);
    let cfg = SchedulerConfig {
        stuck_after_secs: u64::MAX,
        ..SchedulerConfig::default()
    };
    let engine = SchedulerEngine::new(repo.store().clone(), broker.clone(), &cfg);

    let report = engine.tick(t + Duration::days(365)).unwrap();
    assert_eq!(report.sweep, SweepReport::default());
    assert_eq!(reload(&repo, &task).status, TaskStatus::Started);
}
