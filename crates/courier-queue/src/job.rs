//! Queued job rows.

use crate::priority::Priority;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Job identifier (row id of the queue table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Returns the raw id.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Command name, resolved through the command registry.
    pub command: String,

    /// Ordered command parameters.
    pub parameters: Vec<String>,

    /// Priority tier.
    pub priority: Priority,

    /// Creation time; reset when the job is requeued.
    pub created_at: DateTime<Utc>,

    /// Claim time, `None` while queued.
    pub executed_at: Option<DateTime<Utc>>,

    /// Earliest time the job may be claimed.
    pub next_try: Option<DateTime<Utc>>,

    /// Number of failed or interrupted runs so far.
    pub retrial: u32,

    /// Finished (successfully or given up).
    pub done: bool,

    /// Claiming process, 0 when none.
    pub pid: u32,

    /// The producer pinned the priority.
    pub force_priority: bool,
}

impl Job {
    /// Returns true if the job is claimed by some process.
    pub fn is_claimed(&self) -> bool {
        !self.done && (self.executed_at.is_some() || self.pid != 0)
    }

    /// Returns true if the job may be claimed at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        !self.done
            && self.pid == 0
            && self.executed_at.is_none()
            && self.next_try.map_or(true, |t| t <= now)
    }

    /// How long the job has been running at `now`.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.executed_at.map(|started| now - started)
    }

    /// Returns true if this job carries the given command and parameters.
    pub fn same_work(&self, command: &str, parameters: &[String]) -> bool {
        self.command == command && self.parameters == parameters
    }
}

/// Builder for a job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub command: String,
    pub parameters: Vec<String>,
    pub priority: Priority,
    pub force_priority: bool,
    pub delay: Option<Duration>,
}

impl NewJob {
    /// Create a new job builder at the default priority.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: Vec::new(),
            priority: Priority::default(),
            force_priority: false,
            delay: None,
        }
    }

    /// Append a parameter.
    pub fn param(mut self, value: impl Into<String>) -> Self {
        self.parameters.push(value.into());
        self
    }

    /// Append multiple parameters.
    pub fn params(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parameters.extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Overwrite the priority of an identical queued job instead of keeping it.
    pub fn force_priority(mut self, force: bool) -> Self {
        self.force_priority = force;
        self
    }

    /// Set a delay before the job may be claimed.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Earliest claim time for a job enqueued at `now`.
    pub fn next_try_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.delay
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| now + d)
    }
}
