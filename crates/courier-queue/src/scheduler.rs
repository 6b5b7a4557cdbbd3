//! Load-based admission of worker processes.
//!
//! Each supervisor tick turns the sampled database connection load and the
//! per-tier queue counts into a [`WorkerQuota`]: how many workers may run in
//! total and how many new ones each tier may start. Nothing here touches the
//! store; the supervisor samples and the scheduler decides.

use crate::priority::Priority;
use crate::store::{ConnectionLoad, QueueCounts};
use courier_config::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the supervisor runs, selecting its process limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Daemon, cron or one-shot worker invocation.
    #[default]
    Backend,
    /// Embedded in a request-serving process.
    Frontend,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Backend => f.write_str("backend"),
            Role::Frontend => f.write_str("frontend"),
        }
    }
}

/// Scheduler inputs taken from the worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub max_processes_backend: u32,
    pub max_processes_frontend: u32,
    /// Configured connection maximum; 0 defers to the server.
    pub max_connections: u32,
    /// Percentage of connections above which nothing is spawned.
    pub max_connections_level: u32,
    pub load_exponent: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for SchedulerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_processes_backend: config.max_processes_backend,
            max_processes_frontend: config.max_processes_frontend,
            max_connections: config.max_connections,
            max_connections_level: config.max_connections_level,
            load_exponent: config.load_exponent,
        }
    }
}

/// Slots granted to one tier this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBudget {
    pub priority: Priority,
    pub slots: u32,
}

/// Admission result of one scheduling tick.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerQuota {
    /// Connection load fraction in `[0, 1]`.
    pub load: f64,
    /// Load exceeded the configured level; no spawns this tick.
    pub suppressed: bool,
    /// Total workers allowed at this load.
    pub allowed: u32,
    /// Workers already running.
    pub running: u32,
    /// Eligible tiers with their budgets, most urgent first.
    pub budgets: Vec<TierBudget>,
}

impl WorkerQuota {
    /// New workers that may be started over all tiers.
    pub fn total_slots(&self) -> u32 {
        self.budgets.iter().map(|b| b.slots).sum()
    }

    /// Tiers with at least one slot.
    pub fn eligible(&self) -> Vec<Priority> {
        self.budgets.iter().map(|b| b.priority).collect()
    }
}

/// Decides how many workers each tier may start.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    settings: SchedulerSettings,
    role: Role,
}

impl PriorityScheduler {
    /// Create a scheduler for a supervisor with the given role.
    pub fn new(settings: SchedulerSettings, role: Role) -> Self {
        Self { settings, role }
    }

    /// Process limit for this role.
    pub fn max_processes(&self) -> u32 {
        match self.role {
            Role::Backend => self.settings.max_processes_backend,
            Role::Frontend => self.settings.max_processes_frontend,
        }
    }

    /// Connection usage as a fraction of the maximum.
    ///
    /// The configured maximum wins over the server's; with neither known the
    /// load is 0.
    pub fn load_fraction(&self, load: ConnectionLoad) -> f64 {
        let max = if self.settings.max_connections > 0 {
            Some(self.settings.max_connections)
        } else {
            load.server_max.filter(|m| *m > 0)
        };

        match max {
            Some(max) => (f64::from(load.current) / f64::from(max)).clamp(0.0, 1.0),
            None => 0.0,
        }
    }

    /// Workers allowed at load `f`: `round(max * (1 - f)^exponent)`.
    pub fn allowed_processes(&self, f: f64) -> u32 {
        let max = self.max_processes();
        let exponent = i32::try_from(self.settings.load_exponent).unwrap_or(i32::MAX);
        let free = (1.0 - f.clamp(0.0, 1.0)).powi(exponent);
        let allowed = (f64::from(max) * free).round();
        (allowed.max(0.0) as u32).min(max)
    }

    /// Whether the load is above the configured level.
    pub fn is_overloaded(&self, f: f64) -> bool {
        f > f64::from(self.settings.max_connections_level) / 100.0
    }

    /// Compute this tick's quota.
    pub fn plan(&self, load: ConnectionLoad, counts: &QueueCounts) -> WorkerQuota {
        let f = self.load_fraction(load);
        let running = u32::try_from(counts.total_running()).unwrap_or(u32::MAX);

        if self.is_overloaded(f) {
            return WorkerQuota {
                load: f,
                suppressed: true,
                allowed: 0,
                running,
                budgets: Vec::new(),
            };
        }

        let allowed = self.allowed_processes(f);
        let mut remaining = allowed.saturating_sub(running);
        let mut budgets = Vec::new();

        for priority in Priority::ALL {
            if remaining == 0 {
                break;
            }
            let queued = u32::try_from(counts.queued(priority)).unwrap_or(u32::MAX);
            let slots = queued.min(remaining);
            if slots > 0 {
                budgets.push(TierBudget { priority, slots });
                remaining -= slots;
            }
        }

        WorkerQuota {
            load: f,
            suppressed: false,
            allowed,
            running,
            budgets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max: u32) -> SchedulerSettings {
        SchedulerSettings {
            max_processes_backend: max,
            max_processes_frontend: max * 2,
            max_connections: 100,
            max_connections_level: 75,
            load_exponent: 3,
        }
    }

    fn counts(queued: &[(Priority, u64)], running: &[(Priority, u64)]) -> QueueCounts {
        QueueCounts {
            queued: queued.iter().copied().collect(),
            running: running.iter().copied().collect(),
        }
    }

    #[test]
    fn test_backpressure_curve() {
        let scheduler = PriorityScheduler::new(settings(20), Role::Backend);
        assert_eq!(scheduler.allowed_processes(0.0), 20);
        assert_eq!(scheduler.allowed_processes(0.37), 5);
        assert_eq!(scheduler.allowed_processes(1.0), 0);

        let scheduler = PriorityScheduler::new(settings(100), Role::Backend);
        assert_eq!(scheduler.allowed_processes(0.37), 25);
    }

    #[test]
    fn test_curve_is_monotonic() {
        let scheduler = PriorityScheduler::new(settings(50), Role::Backend);
        let mut previous = u32::MAX;
        for step in 0..=100 {
            let allowed = scheduler.allowed_processes(f64::from(step) / 100.0);
            assert!(allowed <= previous);
            assert!(allowed <= 50);
            previous = allowed;
        }
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let scheduler = PriorityScheduler::new(
            SchedulerSettings {
                load_exponent: u32::MAX,
                ..settings(20)
            },
            Role::Backend,
        );
        assert_eq!(scheduler.allowed_processes(0.0), 20);
        assert_eq!(scheduler.allowed_processes(0.5), 0);
    }

    #[test]
    fn test_role_selects_limit() {
        assert_eq!(PriorityScheduler::new(settings(5), Role::Backend).max_processes(), 5);
        assert_eq!(PriorityScheduler::new(settings(5), Role::Frontend).max_processes(), 10);
    }

    #[test]
    fn test_load_fraction_sources() {
        let scheduler = PriorityScheduler::new(settings(5), Role::Backend);
        let load = ConnectionLoad { current: 37, server_max: Some(1000) };
        assert!((scheduler.load_fraction(load) - 0.37).abs() < 1e-9);

        let mut from_server = settings(5);
        from_server.max_connections = 0;
        let scheduler = PriorityScheduler::new(from_server, Role::Backend);
        assert!((scheduler.load_fraction(load) - 0.037).abs() < 1e-9);
        assert_eq!(
            scheduler.load_fraction(ConnectionLoad { current: 37, server_max: None }),
            0.0
        );
    }

    #[test]
    fn test_overload_suppresses_spawns() {
        let scheduler = PriorityScheduler::new(settings(20), Role::Backend);
        let quota = scheduler.plan(
            ConnectionLoad { current: 76, server_max: None },
            &counts(&[(Priority::Critical, 10)], &[]),
        );
        assert!(quota.suppressed);
        assert_eq!(quota.total_slots(), 0);

        let quota = scheduler.plan(
            ConnectionLoad { current: 75, server_max: None },
            &counts(&[(Priority::Critical, 10)], &[]),
        );
        assert!(!quota.suppressed);
    }

    #[test]
    fn test_budget_handed_out_in_tier_order() {
        let scheduler = PriorityScheduler::new(settings(10), Role::Backend);
        let quota = scheduler.plan(
            ConnectionLoad::default(),
            &counts(
                &[(Priority::Critical, 2), (Priority::Medium, 5), (Priority::Low, 9)],
                &[(Priority::High, 1)],
            ),
        );

        assert_eq!(quota.allowed, 10);
        assert_eq!(quota.running, 1);
        assert_eq!(
            quota.budgets,
            vec![
                TierBudget { priority: Priority::Critical, slots: 2 },
                TierBudget { priority: Priority::Medium, slots: 5 },
                TierBudget { priority: Priority::Low, slots: 2 },
            ]
        );
        assert_eq!(quota.eligible(), vec![Priority::Critical, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_no_budget_when_full() {
        let scheduler = PriorityScheduler::new(settings(3), Role::Backend);
        let quota = scheduler.plan(
            ConnectionLoad::default(),
            &counts(&[(Priority::High, 4)], &[(Priority::Low, 3)]),
        );
        assert!(quota.budgets.is_empty());
    }
}
