use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::error::Result;
use crate::lane::Lane;
use crate::repo::{compare_and_swap, select_due};
use crate::store::Store;

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handed off and marked ENQUEUED.
    pub dispatched: usize,
    /// Broker refused the hand-off; the task stays eligible.
    pub handoff_failures: usize,
}

/// Finds due tasks, routes them to a lane and marks them ENQUEUED.
pub struct Dispatcher {
    store: Store,
    broker: Arc<dyn Broker>,
    page_limit: u32,
    /// Set when dispatch should also re-arm `run_at` for retried tasks.
    rearm: Option<Backoff>,
}

impl Dispatcher {
    pub fn new(store: Store, broker: Arc<dyn Broker>, page_limit: u32) -> Self {
        Self {
            store,
            broker,
            page_limit,
            rearm: None,
        }
    }

    /// Push `run_at` forward by `backoff(attempts)` when a retried task is dispatched.
    pub fn with_rearm(mut self, backoff: Backoff) -> Self {
        self.rearm = Some(backoff);
        self
    }

    /// One pass over at most `page_limit` due tasks.
    ///
    /// Hand-offs happen inside the transaction; the batch commits once at the
    /// end. A task whose hand-off fails is left untouched so the next tick
    /// picks it up again. If the commit itself fails, any worker that got a
    /// hand-off finds the row not ENQUEUED and skips it.
    pub fn dispatch(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let report = self.store.write(|tx| {
            let due = select_due(tx, now, self.page_limit)?;
            let mut report = DispatchReport::default();

            for task in &due {
                let lane = Lane::for_priority(i64::from(task.priority));
                let next = task.dispatched(now, self.rearm.as_ref())?;

                if let Err(e) = self.broker.enqueue(lane, &task.id) {
                    warn!(task_id = %task.id, %lane, error = %e, "hand-off failed, will retry next tick");
                    report.handoff_failures += 1;
                    continue;
                }
                if compare_and_swap(tx, task, &next)? {
                    debug!(task_id = %task.id, %lane, priority = task.priority, "task enqueued");
                    report.dispatched += 1;
                }
            }
            Ok(report)
        })?;

        if report.dispatched > 0 || report.handoff_failures > 0 {
            info!(
                dispatched = report.dispatched,
                handoff_failures = report.handoff_failures,
                "dispatch pass complete"
            );
        }
        Ok(report)
    }
}
