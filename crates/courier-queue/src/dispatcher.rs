//! Inline-or-queue decision for pending deliveries.
//!
//! Healthy shared inboxes are delivered on the spot. Everything else becomes
//! an `APDelivery` job whose priority drops as the destination's failure
//! count grows, so one dead server cannot starve delivery to healthy peers.

use crate::commands::Command;
use crate::delivery::{DeliveryReport, InboxDelivery};
use crate::error::JobResult;
use crate::job::{JobId, NewJob};
use crate::metrics::DeliveryMetrics;
use crate::priority::Priority;
use crate::store::JobStore;
use crate::tracker::{DeliveryTarget, DeliveryTargetTracker};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What happened to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// Delivered in this run.
    Inline(DeliveryReport),
    /// Handed to the queue.
    Enqueued { job_id: JobId, priority: Priority },
    /// Every pending row was pruned; nothing left to deliver.
    Pruned { removed: u64 },
}

/// Summary of a dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub destinations: usize,
    pub inline_succeeded: usize,
    pub inline_failed: usize,
    pub enqueued: usize,
    pub pruned_rows: u64,
    pub errors: Vec<String>,
}

/// Decides, per destination, between inline delivery and the queue.
pub struct DeliveryDispatcher {
    tracker: Arc<DeliveryTargetTracker>,
    jobs: Arc<dyn JobStore>,
    delivery: Arc<dyn InboxDelivery>,
    defer_limit: u32,
}

impl DeliveryDispatcher {
    pub fn new(
        tracker: Arc<DeliveryTargetTracker>,
        jobs: Arc<dyn JobStore>,
        delivery: Arc<dyn InboxDelivery>,
        defer_limit: u32,
    ) -> Self {
        Self {
            tracker,
            jobs,
            delivery,
            defer_limit,
        }
    }

    /// Handle one destination.
    pub async fn dispatch(&self, target: &DeliveryTarget) -> JobResult<DispatchAction> {
        let mut pruned = 0;
        if target.failed > 0 {
            debug!(inbox = %target.inbox, failed = target.failed, "Destination has failed deliveries");
            pruned = self
                .tracker
                .prune_inbox_failures(&target.inbox, self.defer_limit)
                .await?;
            if pruned > 0 {
                DeliveryMetrics::failures_pruned(pruned);
                if self.tracker.pending_for_inbox(&target.inbox).await?.is_empty() {
                    return Ok(DispatchAction::Pruned { removed: pruned });
                }
            }
        } else if target.shared && self.server_reachable(target).await {
            let report = self.delivery.deliver(&target.inbox).await?;
            self.tracker.record_report(&report).await?;
            DeliveryMetrics::delivered_inline(report.success);
            info!(inbox = %target.inbox, success = report.success, "Delivered inbox inline");
            return Ok(DispatchAction::Inline(report));
        }

        let priority = Priority::for_failures(target.failed);
        let job_id = self
            .jobs
            .enqueue(
                NewJob::new(Command::ApDelivery.name())
                    .param(target.inbox.clone())
                    .priority(priority)
                    .force_priority(true),
            )
            .await?;
        DeliveryMetrics::delivery_enqueued(priority);
        info!(
            inbox = %target.inbox,
            failed = target.failed,
            pruned,
            priority = %priority,
            job_id = %job_id,
            "Delivery queued"
        );

        Ok(DispatchAction::Enqueued { job_id, priority })
    }

    /// Handle every destination with pending activities.
    ///
    /// Errors are logged per destination and reported; they never abort the
    /// run.
    pub async fn dispatch_pending(&self) -> DispatchReport {
        let mut report = DispatchReport::default();

        let targets = match self.tracker.list_pending_aggregated_by_destination().await {
            Ok(targets) => targets,
            Err(e) => {
                error!(error = %e, "Failed to list pending deliveries");
                report.errors.push(e.to_string());
                return report;
            }
        };

        report.destinations = targets.len();
        for target in &targets {
            match self.dispatch(target).await {
                Ok(DispatchAction::Inline(delivery)) if delivery.success => {
                    report.inline_succeeded += 1;
                }
                Ok(DispatchAction::Inline(_)) => report.inline_failed += 1,
                Ok(DispatchAction::Enqueued { .. }) => report.enqueued += 1,
                Ok(DispatchAction::Pruned { removed }) => report.pruned_rows += removed,
                Err(e) => {
                    error!(inbox = %target.inbox, error = %e, "Failed to dispatch delivery");
                    report.errors.push(format!("{}: {}", target.inbox, e));
                }
            }
        }

        report
    }

    /// Inboxes without a known server are never delivered inline.
    async fn server_reachable(&self, target: &DeliveryTarget) -> bool {
        match target.server_id {
            Some(server_id) => self.tracker.is_reachable(server_id).await,
            None => false,
        }
    }
}
