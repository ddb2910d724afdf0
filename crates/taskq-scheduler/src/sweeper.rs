use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::error::Result;
use crate::repo::{apply_failure, compare_and_swap, select_stale_enqueued, select_stuck};
use crate::state::FailureCause;
use crate::store::{clamp_storable, earliest_storable, Store};
use crate::types::DeadLetter;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck tasks moved to FAILED with a retry scheduled.
    pub failed: usize,
    /// Stuck tasks that ran out of retries.
    pub dead: usize,
    /// ENQUEUED tasks no worker claimed, returned to PENDING.
    pub requeued: usize,
}

/// Recovers tasks that were claimed by a worker but never reported back,
/// and hand-offs that no worker ever claimed.
///
/// Only bookkeeping is reclaimed: the original execution may still be
/// running, and its eventual report is rejected by the attempt fence. A
/// requeued hand-off that is delivered late is skipped by the claim, since
/// the row is no longer ENQUEUED.
pub struct Sweeper {
    store: Store,
    broker: Arc<dyn Broker>,
    stuck_after: Duration,
    page_limit: u32,
    backoff: Backoff,
}

impl Sweeper {
    pub fn new(
        store: Store,
        broker: Arc<dyn Broker>,
        stuck_after: Duration,
        page_limit: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            broker,
            stuck_after,
            page_limit,
            backoff,
        }
    }

    /// One pass over at most `page_limit` tasks STARTED at or before
    /// `now - stuck_after`, oldest first, then over at most `page_limit`
    /// tasks left ENQUEUED for as long.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now
            .checked_sub_signed(self.stuck_after)
            .map_or_else(earliest_storable, clamp_storable);

        let (report, letters) = self.store.write(|tx| {
            let stuck = select_stuck(tx, cutoff, self.page_limit)?;
            let mut report = SweepReport::default();
            let mut letters: Vec<DeadLetter> = Vec::new();

            for task in &stuck {
                let Some(outcome) =
                    apply_failure(tx, task, FailureCause::StuckTimeout, now, &self.backoff)?
                else {
                    continue;
                };
                match outcome.dead_letter {
                    Some(letter) => {
                        report.dead += 1;
                        letters.push(letter);
                    }
                    None => report.failed += 1,
                }
            }

            for task in &select_stale_enqueued(tx, cutoff, self.page_limit)? {
                if compare_and_swap(tx, task, &task.requeued(now)?)? {
                    report.requeued += 1;
                }
            }
            Ok((report, letters))
        })?;

        // Audit events go out only once the DEAD rows are committed.
        for letter in &letters {
            if let Err(e) = self.broker.publish_dead_letter(letter) {
                warn!(task_id = %letter.task_id, error = %e, "dead-letter publish failed");
            }
        }

        if report.failed > 0 || report.dead > 0 {
            info!(failed = report.failed, dead = report.dead, "stuck tasks swept");
        }
        if report.requeued > 0 {
            warn!(count = report.requeued, "unclaimed hand-offs returned to pending");
        }
        Ok(report)
    }
}
