//! Configuration validation module.
//!
//! Collects every problem in one pass so a misconfigured deployment fails at
//! startup with the full list instead of one error per restart.

use crate::{AppConfig, LockBackend};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Value must be positive.
    NonPositiveValue { name: String },
    /// Value exceeds its upper bound.
    ValueTooLarge { name: String, value: u64, maximum: u64 },
    /// Percentage outside 1..=100.
    InvalidPercentage { name: String, value: u32 },
    /// Cron expression does not parse.
    InvalidCronExpression { expression: String, message: String },
    /// Metrics listen address does not parse.
    InvalidListenAddress { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoolSize { min, max } => {
                write!(
                    f,
                    "Invalid pool size: min ({}) cannot be greater than max ({})",
                    min, max
                )
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(
                    f,
                    "Pool size {} exceeds maximum allowed ({})",
                    value, maximum
                )
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::NonPositiveValue { name } => {
                write!(f, "'{}' must be positive", name)
            }
            Self::ValueTooLarge { name, value, maximum } => {
                write!(f, "'{}' is {}, at most {} is allowed", name, value, maximum)
            }
            Self::InvalidPercentage { name, value } => {
                write!(f, "'{}' must be between 1 and 100, got {}", name, value)
            }
            Self::InvalidCronExpression { expression, message } => {
                write!(f, "Invalid cron expression '{}': {}", expression, message)
            }
            Self::InvalidListenAddress { value } => {
                write!(f, "Invalid metrics listen address: '{}'", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositiveValue {
                name: name.to_string(),
            });
        }
    }

    fn require_at_most(&mut self, name: &str, value: u64, maximum: u64) {
        if value > maximum {
            self.add_error(ConfigValidationError::ValueTooLarge {
                name: name.to_string(),
                value,
                maximum,
            });
        }
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;

    /// Retrials past this wait longer than a year between tries.
    const MAX_DEFER_LIMIT: u32 = 100;

    /// Steeper curves leave no workers at any measurable load.
    const MAX_LOAD_EXPONENT: u32 = 16;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        Self::validate_database(&config.database, &mut result);
        Self::validate_redis(config, &mut result);
        Self::validate_worker(&config.worker, &mut result);
        Self::validate_delivery(&config.delivery, &mut result);
        Self::validate_daemon(&config.daemon, &mut result);
        Self::validate_metrics(&config.metrics, &mut result);

        result.into_result()
    }

    fn validate_database(config: &crate::DatabaseConfig, result: &mut ValidationResult) {
        if config.url.is_empty() {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        } else if !config.url.starts_with("mysql://") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL must start with mysql://".to_string(),
            });
        }

        if config.min_connections > config.max_connections {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                min: config.min_connections,
                max: config.max_connections,
            });
        }
        if config.max_connections > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        result.require_positive("database.connect_timeout_secs", config.connect_timeout_secs);
        result.require_positive("database.idle_timeout_secs", config.idle_timeout_secs);
    }

    /// Redis is only checked when it backs the named locks.
    fn validate_redis(config: &AppConfig, result: &mut ValidationResult) {
        if config.locks.backend != LockBackend::Redis {
            return;
        }

        let redis = &config.redis;
        if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: "URL must start with redis:// or rediss://".to_string(),
            });
        } else if let Err(e) = Url::parse(&redis.url) {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            });
        }

        if redis.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: redis.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        result.require_positive("locks.timeout_secs", config.locks.timeout_secs);
        result.require_positive("locks.ttl_secs", config.locks.ttl_secs);
    }

    fn validate_worker(config: &crate::WorkerConfig, result: &mut ValidationResult) {
        result.require_positive(
            "worker.max_processes_backend",
            u64::from(config.max_processes_backend),
        );
        result.require_positive(
            "worker.max_processes_frontend",
            u64::from(config.max_processes_frontend),
        );
        result.require_positive("worker.load_exponent", u64::from(config.load_exponent));
        result.require_at_most(
            "worker.load_exponent",
            u64::from(config.load_exponent),
            u64::from(Self::MAX_LOAD_EXPONENT),
        );
        result.require_at_most(
            "worker.defer_limit",
            u64::from(config.defer_limit),
            u64::from(Self::MAX_DEFER_LIMIT),
        );
        result.require_positive("worker.fetch_limit", u64::from(config.fetch_limit));

        if config.max_connections_level == 0 || config.max_connections_level > 100 {
            result.add_error(ConfigValidationError::InvalidPercentage {
                name: "worker.max_connections_level".to_string(),
                value: config.max_connections_level,
            });
        }

        let durations = &config.max_duration;
        for (name, value) in [
            ("worker.max_duration.critical", durations.critical),
            ("worker.max_duration.high", durations.high),
            ("worker.max_duration.medium", durations.medium),
            ("worker.max_duration.low", durations.low),
            ("worker.max_duration.negligible", durations.negligible),
        ] {
            result.require_positive(name, value);
        }
    }

    fn validate_delivery(config: &crate::DeliveryConfig, result: &mut ValidationResult) {
        result.require_positive("delivery.request_timeout_secs", config.request_timeout_secs);
    }

    fn validate_daemon(config: &crate::DaemonConfig, result: &mut ValidationResult) {
        result.require_positive("daemon.tick_interval_ms", config.tick_interval_ms);

        if let Err(e) = cron::Schedule::from_str(&config.cron_schedule) {
            result.add_error(ConfigValidationError::InvalidCronExpression {
                expression: config.cron_schedule.clone(),
                message: e.to_string(),
            });
        }
    }

    fn validate_metrics(config: &crate::MetricsConfig, result: &mut ValidationResult) {
        if let Some(ref addr) = config.prometheus_addr {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                result.add_error(ConfigValidationError::InvalidListenAddress {
                    value: addr.clone(),
                });
            }
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
