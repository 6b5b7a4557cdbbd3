//! Command registry.
//!
//! Jobs carry an opaque command name and string parameters. The names are
//! resolved once, through a closed [`Command`] enum, to executors registered
//! at startup.

use crate::cron::CronSweep;
use crate::delivery::InboxDelivery;
use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::tracker::DeliveryTargetTracker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Known job commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Deliver everything pending for one inbox. Parameters: `[inbox]`.
    ApDelivery,
    /// Deliver everything pending for one server. Parameters: `[server_id]`.
    BulkDelivery,
    /// Periodic maintenance sweep. No parameters.
    Cron,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::ApDelivery, Command::BulkDelivery, Command::Cron];

    /// Name stored in the job row.
    pub fn name(self) -> &'static str {
        match self {
            Command::ApDelivery => "APDelivery",
            Command::BulkDelivery => "BulkDelivery",
            Command::Cron => "Cron",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| JobError::UnknownCommand(s.to_string()))
    }
}

/// What a worker is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Job,
    /// Pid of the worker (real or synthetic).
    pub worker_pid: u32,
}

impl JobContext {
    pub fn new(job: Job, worker_pid: u32) -> Self {
        Self { job, worker_pid }
    }

    /// Parameter at `index`, or an [`JobError::InvalidParameters`].
    pub fn param(&self, index: usize, name: &str) -> JobResult<&str> {
        self.job
            .parameters
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                JobError::invalid_parameters(&self.job.command, format!("missing {}", name))
            })
    }
}

/// How a command run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Finished; the job is marked done.
    Completed,
    /// Try again later with backoff.
    Defer,
}

/// Runs one command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> JobResult<CommandOutcome>;

    /// Called when a deferred job exceeded the retrial limit.
    async fn on_give_up(&self, _ctx: &JobContext) -> JobResult<()> {
        Ok(())
    }
}

/// Lookup table from command to executor.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    executors: HashMap<Command, Arc<dyn CommandExecutor>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one.
    pub fn register(mut self, command: Command, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executors.insert(command, executor);
        self
    }

    /// Executor for a stored command name.
    pub fn resolve(&self, name: &str) -> JobResult<Arc<dyn CommandExecutor>> {
        let command: Command = name.parse()?;
        self.executors
            .get(&command)
            .cloned()
            .ok_or_else(|| JobError::UnknownCommand(name.to_string()))
    }

    /// Registered commands.
    pub fn commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.executors.keys().copied().collect();
        commands.sort_by_key(|c| c.name());
        commands
    }
}

/// `APDelivery`: deliver the pending activities of one inbox.
pub struct ApDeliveryCommand {
    tracker: Arc<DeliveryTargetTracker>,
    delivery: Arc<dyn InboxDelivery>,
}

impl ApDeliveryCommand {
    pub fn new(tracker: Arc<DeliveryTargetTracker>, delivery: Arc<dyn InboxDelivery>) -> Self {
        Self { tracker, delivery }
    }
}

#[async_trait]
impl CommandExecutor for ApDeliveryCommand {
    async fn execute(&self, ctx: &JobContext) -> JobResult<CommandOutcome> {
        let inbox = ctx.param(0, "inbox")?;
        let report = self.delivery.deliver(inbox).await?;
        self.tracker.record_report(&report).await?;

        if report.success {
            Ok(CommandOutcome::Completed)
        } else {
            Ok(CommandOutcome::Defer)
        }
    }

    async fn on_give_up(&self, ctx: &JobContext) -> JobResult<()> {
        let inbox = ctx.param(0, "inbox")?;
        let removed = self.tracker.prune_inbox_failures(inbox, 0).await?;
        warn!(inbox = %inbox, removed, "Giving up on inbox, dropped pending activities");
        Ok(())
    }
}

/// `BulkDelivery`: deliver the pending activities of every inbox on a server.
///
/// Stops at the first inbox that fails, since the server is then presumed
/// down.
pub struct BulkDeliveryCommand {
    tracker: Arc<DeliveryTargetTracker>,
    delivery: Arc<dyn InboxDelivery>,
}

impl BulkDeliveryCommand {
    pub fn new(tracker: Arc<DeliveryTargetTracker>, delivery: Arc<dyn InboxDelivery>) -> Self {
        Self { tracker, delivery }
    }
}

#[async_trait]
impl CommandExecutor for BulkDeliveryCommand {
    async fn execute(&self, ctx: &JobContext) -> JobResult<CommandOutcome> {
        let raw = ctx.param(0, "server_id")?;
        let server_id: i64 = raw.parse().map_err(|_| {
            JobError::invalid_parameters(&ctx.job.command, format!("invalid server id {:?}", raw))
        })?;

        let inboxes = self.tracker.inboxes_for_server(server_id).await?;
        let mut delivered = 0;
        for inbox in &inboxes {
            let report = self.delivery.deliver(inbox).await?;
            self.tracker.record_report(&report).await?;
            if !report.success {
                warn!(server_id, inbox = %inbox, delivered, "Bulk delivery stopped by failing inbox");
                return Ok(CommandOutcome::Defer);
            }
            delivered += 1;
        }

        info!(server_id, inboxes = delivered, "Bulk delivery finished");
        Ok(CommandOutcome::Completed)
    }
}

/// `Cron`: the periodic maintenance sweep.
pub struct CronCommand {
    sweep: Arc<CronSweep>,
}

impl CronCommand {
    pub fn new(sweep: Arc<CronSweep>) -> Self {
        Self { sweep }
    }
}

#[async_trait]
impl CommandExecutor for CronCommand {
    async fn execute(&self, _ctx: &JobContext) -> JobResult<CommandOutcome> {
        self.sweep.run().await;
        Ok(CommandOutcome::Completed)
    }
}
