//! Deferral of jobs that asked to be retried later.
//!
//! Delays grow with the fourth power of the retrial number plus random
//! jitter. A job that has been waiting long already skips retrial levels, and
//! after a few retrials its priority is lowered so it stops competing with
//! fresh work. Past the defer limit the job is given up.

use crate::job::Job;
use crate::priority::Priority;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

/// Longest delay between two tries.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// What to do with a job that asked to be deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferDecision {
    /// Try again at `next_try`.
    Retry {
        retrial: u32,
        next_try: DateTime<Utc>,
        delay: Duration,
        priority: Priority,
    },
    /// The retrial limit is exceeded.
    GiveUp { retrial: u32 },
}

/// Backoff rules for deferred jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferPolicy {
    defer_limit: u32,
}

impl DeferPolicy {
    /// Policy giving up once the retrial number exceeds `defer_limit`.
    pub fn new(defer_limit: u32) -> Self {
        Self { defer_limit }
    }

    pub fn defer_limit(&self) -> u32 {
        self.defer_limit
    }

    /// Next retrial number of a job.
    ///
    /// Normally the current retrial plus one. If the time since the job was
    /// created already covers the cumulative delays of later levels, it
    /// jumps to the highest level covered.
    pub fn next_retrial<R: Rng + ?Sized>(&self, job: &Job, now: DateTime<Utc>, rng: &mut R) -> u32 {
        let waited = u64::try_from((now - job.created_at).num_seconds()).unwrap_or(0);

        let mut next = job.retrial.saturating_add(1);
        let mut total: u64 = 0;
        for level in 0..=self.defer_limit.saturating_add(1) {
            let base = (u64::from(level) + 3).saturating_pow(4);
            let jitter = rng.gen_range(1..=30u64).saturating_mul(u64::from(level) + 1);
            total = total.saturating_add(base).saturating_add(jitter);
            if total >= waited {
                break;
            }
            if level > job.retrial {
                next = level;
            }
        }
        next
    }

    /// Delay before retrial `retrial` runs, at most [`MAX_DELAY`].
    pub fn delay_for<R: Rng + ?Sized>(retrial: u32, rng: &mut R) -> Duration {
        let base = (u64::from(retrial) + 2).saturating_pow(4);
        let jitter = rng.gen_range(1..=30u64).saturating_mul(u64::from(retrial));
        Duration::from_secs(base.saturating_add(jitter)).min(MAX_DELAY)
    }

    /// Priority after reaching `retrial`. Only ever lowered, one step at a
    /// time: MEDIUM past 3, LOW past 6, NEGLIGIBLE past 8.
    pub fn lowered_priority(priority: Priority, retrial: u32) -> Priority {
        if priority < Priority::Medium && retrial > 3 {
            Priority::Medium
        } else if priority < Priority::Low && retrial > 6 {
            Priority::Low
        } else if priority < Priority::Negligible && retrial > 8 {
            Priority::Negligible
        } else {
            priority
        }
    }

    /// Decide how to defer `job`.
    pub fn decide<R: Rng + ?Sized>(&self, job: &Job, now: DateTime<Utc>, rng: &mut R) -> DeferDecision {
        let retrial = self.next_retrial(job, now, rng);
        if retrial > self.defer_limit {
            return DeferDecision::GiveUp { retrial };
        }

        let delay = Self::delay_for(retrial, rng);
        let next_try = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::days(365));

        DeferDecision::Retry {
            retrial,
            next_try,
            delay,
            priority: Self::lowered_priority(job.priority, retrial),
        }
    }
}

impl Default for DeferPolicy {
    fn default() -> Self {
        Self::new(15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn job(retrial: u32, age_secs: i64, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId(1),
            command: "APDelivery".to_string(),
            parameters: vec!["https://a.example/inbox".to_string()],
            priority: Priority::High,
            created_at: now - ChronoDuration::seconds(age_secs),
            executed_at: Some(now),
            next_try: None,
            retrial,
            done: false,
            pid: 77,
            force_priority: true,
        }
    }

    #[test]
    fn test_fresh_job_advances_one_level() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);
        let policy = DeferPolicy::new(15);

        assert_eq!(policy.next_retrial(&job(0, 10, now), now, &mut rng), 1);
        assert_eq!(policy.next_retrial(&job(4, 10, now), now, &mut rng), 5);
    }

    #[test]
    fn test_old_job_catches_up() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);
        let policy = DeferPolicy::new(15);

        // Levels 0..=3 add up to at most 2558 seconds, level 4 to at least 4659.
        let next = policy.next_retrial(&job(0, 3_000, now), now, &mut rng);
        assert!(next >= 3, "expected catch-up, got {}", next);
    }

    #[test]
    fn test_delay_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for retrial in 1..10u32 {
            let delay = DeferPolicy::delay_for(retrial, &mut rng).as_secs();
            let base = u64::from(retrial + 2).pow(4);
            assert!(delay > base);
            assert!(delay <= base + 30 * u64::from(retrial));
        }
    }

    #[test]
    fn test_priority_lowered_step_by_step() {
        assert_eq!(DeferPolicy::lowered_priority(Priority::High, 3), Priority::High);
        assert_eq!(DeferPolicy::lowered_priority(Priority::High, 4), Priority::Medium);
        assert_eq!(DeferPolicy::lowered_priority(Priority::Medium, 7), Priority::Low);
        assert_eq!(DeferPolicy::lowered_priority(Priority::Low, 9), Priority::Negligible);
        assert_eq!(DeferPolicy::lowered_priority(Priority::Critical, 9), Priority::Medium);
        assert_eq!(DeferPolicy::lowered_priority(Priority::Negligible, 12), Priority::Negligible);
    }

    #[test]
    fn test_large_limits_do_not_overflow() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(5);

        let policy = DeferPolicy::new(100_000);
        assert!(matches!(
            policy.decide(&job(0, 10, now), now, &mut rng),
            DeferDecision::Retry { retrial: 1, .. }
        ));

        let policy = DeferPolicy::new(u32::MAX);
        let next = policy.next_retrial(&job(u32::MAX - 1, 10, now), now, &mut rng);
        assert_eq!(next, u32::MAX);

        assert_eq!(DeferPolicy::delay_for(u32::MAX, &mut rng), MAX_DELAY);
        assert_eq!(DeferPolicy::delay_for(5_000, &mut rng), MAX_DELAY);
    }

    #[test]
    fn test_gives_up_past_limit() {
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(1);
        let policy = DeferPolicy::new(2);

        match policy.decide(&job(2, 10, now), now, &mut rng) {
            DeferDecision::GiveUp { retrial } => assert_eq!(retrial, 3),
            other => panic!("expected give up, got {:?}", other),
        }

        match policy.decide(&job(0, 10, now), now, &mut rng) {
            DeferDecision::Retry { retrial, next_try, .. } => {
                assert_eq!(retrial, 1);
                assert!(next_try > now);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }
}
