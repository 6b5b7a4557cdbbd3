//! Runs one claimed job to completion.
//!
//! This is what a worker process does: resolve the job's command, run it, and
//! record the outcome in the store. Deferred jobs go through the
//! [`DeferPolicy`]; permanent failures and unknown commands mark the job done
//! so it never blocks the queue.

use crate::commands::{CommandExecutor, CommandOutcome, CommandRegistry, JobContext};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId};
use crate::metrics::JobMetrics;
use crate::priority::Priority;
use crate::retry::{DeferDecision, DeferPolicy};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Deferred {
        retrial: u32,
        next_try: DateTime<Utc>,
        priority: Priority,
    },
    /// Deferred past the retrial limit.
    GaveUp { retrial: u32 },
    /// Failed permanently; the job was marked done.
    Failed(String),
    /// The job was already done.
    Skipped,
}

/// Executes claimed jobs.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    commands: CommandRegistry,
    policy: DeferPolicy,
    cooldown: Duration,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        commands: CommandRegistry,
        policy: DeferPolicy,
        cooldown: Duration,
    ) -> Self {
        Self {
            store,
            commands,
            policy,
            cooldown,
        }
    }

    /// Load and run a job. Entry point of `courier execute --job <id>`.
    pub async fn run_by_id(&self, id: JobId, worker_pid: u32) -> JobResult<RunOutcome> {
        let job = self.store.get(id).await?.ok_or(JobError::NotFound(id))?;
        if job.done {
            warn!(job_id = %id, "Job already done, skipping");
            return Ok(RunOutcome::Skipped);
        }
        self.run(JobContext::new(job, worker_pid)).await
    }

    /// Run a job and record its outcome.
    pub async fn run(&self, ctx: JobContext) -> JobResult<RunOutcome> {
        let job_id = ctx.job.id;
        let command = ctx.job.command.clone();

        if !self.cooldown.is_zero() {
            debug!(job_id = %job_id, cooldown_ms = self.cooldown.as_millis() as u64, "Cooling down before job");
            tokio::time::sleep(self.cooldown).await;
        }

        let executor = match self.commands.resolve(&command) {
            Ok(executor) => executor,
            Err(e) => {
                warn!(job_id = %job_id, command = %command, error = %e, "Unknown command, marking done");
                self.store.mark_done(job_id).await?;
                JobMetrics::job_given_up(&command, "unknown_command");
                return Ok(RunOutcome::Failed(e.to_string()));
            }
        };

        info!(job_id = %job_id, command = %command, priority = %ctx.job.priority, retrial = ctx.job.retrial, "Running job");
        let started = Instant::now();
        let result = executor.execute(&ctx).await;
        let elapsed = started.elapsed();

        match result {
            Ok(CommandOutcome::Completed) => {
                self.store.mark_done(job_id).await?;
                JobMetrics::job_completed(&command, elapsed);
                info!(job_id = %job_id, command = %command, duration_ms = elapsed.as_millis() as u64, "Job completed");
                Ok(RunOutcome::Completed)
            }
            Ok(CommandOutcome::Defer) => self.defer(&ctx, executor.as_ref()).await,
            Err(e) if e.is_transient() => {
                warn!(job_id = %job_id, command = %command, error = %e, "Job failed transiently, deferring");
                self.defer(&ctx, executor.as_ref()).await
            }
            Err(e) => {
                error!(job_id = %job_id, command = %command, error = %e, "Job failed");
                self.store.mark_done(job_id).await?;
                JobMetrics::job_given_up(&command, "failed");
                Ok(RunOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn defer(
        &self,
        ctx: &JobContext,
        executor: &dyn CommandExecutor,
    ) -> JobResult<RunOutcome> {
        let job: &Job = &ctx.job;
        let decision = {
            let mut rng = rand::thread_rng();
            self.policy.decide(job, Utc::now(), &mut rng)
        };

        match decision {
            DeferDecision::Retry {
                retrial,
                next_try,
                delay,
                priority,
            } => {
                self.store.defer(job.id, retrial, next_try, priority).await?;
                JobMetrics::job_deferred(&job.command, retrial);
                info!(
                    job_id = %job.id,
                    retrial,
                    delay_secs = delay.as_secs(),
                    old_priority = %job.priority,
                    priority = %priority,
                    "Deferred job"
                );
                Ok(RunOutcome::Deferred {
                    retrial,
                    next_try,
                    priority,
                })
            }
            DeferDecision::GiveUp { retrial } => {
                warn!(
                    job_id = %job.id,
                    retrial,
                    defer_limit = self.policy.defer_limit(),
                    "Job exceeded the maximum retry count"
                );
                if let Err(e) = executor.on_give_up(ctx).await {
                    error!(job_id = %job.id, error = %e, "Give-up handler failed");
                }
                self.store.mark_done(job.id).await?;
                JobMetrics::job_given_up(&job.command, "defer_limit");
                Ok(RunOutcome::GaveUp { retrial })
            }
        }
    }
}
