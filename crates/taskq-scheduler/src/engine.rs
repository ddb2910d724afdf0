use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use taskq_core::config::SchedulerConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    broker::Broker,
    dispatcher::{DispatchReport, Dispatcher},
    error::Result,
    repo::TaskRepository,
    store::Store,
    sweeper::{SweepReport, Sweeper},
};

/// Combined outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sweep: SweepReport,
    pub dispatch: DispatchReport,
}

/// Drives the sweeper and the dispatcher on a fixed interval.
///
/// Strictly sequential: within a tick the sweep runs to completion before
/// dispatch starts, so recovered tasks are immediately eligible.
pub struct SchedulerEngine {
    repo: TaskRepository,
    sweeper: Sweeper,
    dispatcher: Dispatcher,
    poll_interval: StdDuration,
    requeue_on_start: bool,
}

impl SchedulerEngine {
    /// Build an engine over `store`, handing tasks to `broker`.
    pub fn new(store: Store, broker: Arc<dyn Broker>, cfg: &SchedulerConfig) -> Self {
        let backoff = Backoff::from_config(cfg);
        let stuck_after = Duration::seconds(cfg.stuck_after_secs.min((i64::MAX / 1_000) as u64) as i64);

        let sweeper = Sweeper::new(
            store.clone(),
            Arc::clone(&broker),
            stuck_after,
            cfg.page_limit,
            backoff,
        );
        let mut dispatcher = Dispatcher::new(store.clone(), broker, cfg.page_limit);
        if cfg.rearm_on_dispatch {
            dispatcher = dispatcher.with_rearm(backoff);
        }

        Self {
            repo: TaskRepository::new(store),
            sweeper,
            dispatcher,
            poll_interval: StdDuration::from_millis(cfg.poll_interval_ms.max(1)),
            requeue_on_start: cfg.requeue_enqueued_on_startup,
        }
    }

    /// Sweep then dispatch, as of `now`. A failing sweep aborts the tick.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let sweep = self.sweeper.sweep(now)?;
        let dispatch = self.dispatcher.dispatch(now)?;
        Ok(TickReport { sweep, dispatch })
    }

    /// Main event loop. Ticks every `poll_interval` until `shutdown` broadcasts `true`.
    ///
    /// Tick errors are logged and the loop carries on.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "scheduler engine started"
        );
        if self.requeue_on_start {
            self.requeue_lost_handoffs();
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()) {
                        Ok(report) => debug!(?report, "tick complete"),
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    /// ENQUEUED rows from a previous process never reached a worker.
    fn requeue_lost_handoffs(&self) {
        match self.repo.requeue_enqueued(Utc::now()) {
            Ok(n) if n > 0 => warn!(count = n, "enqueued tasks returned to pending on startup"),
            Err(e) => error!("startup requeue failed: {e}"),
            _ => {}
        }
    }
}
