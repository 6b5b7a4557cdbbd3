//! Job priority tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job priority tiers.
///
/// Stored as the integers 10 to 50; ascending order is most urgent first, so
/// the derived `Ord` sorts `Critical` before `Negligible`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    /// Time-sensitive work; never demoted.
    Critical = 10,
    /// Normal user-facing work.
    High = 20,
    /// Default tier.
    #[default]
    Medium = 30,
    /// Background maintenance.
    Low = 40,
    /// Work that may be starved indefinitely.
    Negligible = 50,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Negligible,
    ];

    /// One tier lower. `Critical` and `Negligible` stay where they are.
    pub fn demote(self) -> Self {
        match self {
            Priority::Critical => Priority::Critical,
            Priority::High => Priority::Medium,
            Priority::Medium => Priority::Low,
            Priority::Low | Priority::Negligible => Priority::Negligible,
        }
    }

    /// Delivery priority for a destination with `failed` recorded failures.
    pub fn for_failures(failed: u32) -> Self {
        if failed < 3 {
            Priority::High
        } else if failed < 6 {
            Priority::Medium
        } else if failed < 8 {
            Priority::Low
        } else {
            Priority::Negligible
        }
    }

    /// The stored integer value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Lowercase label, used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Negligible => "negligible",
        }
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            v if v <= 10 => Priority::Critical,
            v if v <= 20 => Priority::High,
            v if v <= 30 => Priority::Medium,
            v if v <= 40 => Priority::Low,
            _ => Priority::Negligible,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "negligible" => Ok(Priority::Negligible),
            other => other
                .parse::<u8>()
                .map(Priority::from)
                .map_err(|_| format!("unknown priority: {}", s)),
        }
    }
}
