//! The periodic maintenance sweep.

use crate::daemon::{DaemonWatchdog, WatchdogOutcome};
use crate::dispatcher::{DeliveryDispatcher, DispatchReport};
use crate::supervisor::{CleanReport, SweepReport, WorkerSupervisor};
use crate::tracker::DeliveryTargetTracker;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// What one sweep did.
#[derive(Debug, Clone, Default)]
pub struct CronReport {
    pub stale: SweepReport,
    pub clean: CleanReport,
    pub dispatch: DispatchReport,
    /// Rows dropped by the global failure prune.
    pub pruned: u64,
    pub watchdog: Option<WatchdogOutcome>,
    pub errors: Vec<String>,
}

/// Stale sweep, queue cleanup, delivery dispatch, failure prune and the
/// daemon watchdog, in that order.
pub struct CronSweep {
    supervisor: Arc<WorkerSupervisor>,
    dispatcher: Arc<DeliveryDispatcher>,
    tracker: Arc<DeliveryTargetTracker>,
    defer_limit: u32,
    watchdog: Option<Arc<DaemonWatchdog>>,
}

impl CronSweep {
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        dispatcher: Arc<DeliveryDispatcher>,
        tracker: Arc<DeliveryTargetTracker>,
        defer_limit: u32,
    ) -> Self {
        Self {
            supervisor,
            dispatcher,
            tracker,
            defer_limit,
            watchdog: None,
        }
    }

    /// Also check the daemon at the end of each sweep.
    pub fn with_watchdog(mut self, watchdog: Arc<DaemonWatchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Run every step. A failing step is logged and the next one still runs.
    pub async fn run(&self) -> CronReport {
        let started = Instant::now();
        let mut report = CronReport {
            stale: self.supervisor.sweep_stale().await,
            clean: self.supervisor.clean_queue().await,
            dispatch: self.dispatcher.dispatch_pending().await,
            ..CronReport::default()
        };

        match self.tracker.prune_failures_beyond(self.defer_limit).await {
            Ok(removed) => report.pruned = removed,
            Err(e) => {
                error!(error = %e, "Failed to prune undeliverable activities");
                report.errors.push(e.to_string());
            }
        }

        if let Some(watchdog) = &self.watchdog {
            match watchdog.check().await {
                Ok(outcome) => report.watchdog = Some(outcome),
                Err(e) => {
                    error!(error = %e, "Daemon watchdog failed");
                    report.errors.push(e.to_string());
                }
            }
        }

        info!(
            released = report.stale.released.len(),
            killed = report.stale.killed.len(),
            deleted = report.clean.deleted,
            destinations = report.dispatch.destinations,
            enqueued = report.dispatch.enqueued,
            pruned = report.pruned,
            duration_ms = started.elapsed().as_millis() as u64,
            "Cron sweep finished"
        );
        report
    }
}
