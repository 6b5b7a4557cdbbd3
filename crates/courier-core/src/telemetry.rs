//! Tracing subscriber setup.
//!
//! Every Courier binary calls [`init_telemetry`] once at startup. The filter
//! comes from `RUST_LOG` when set, then from the configured filter, then from
//! [`DEFAULT_FILTER`].

use crate::{CourierError, CourierResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the configuration provide one.
pub const DEFAULT_FILTER: &str = "info,courier=debug";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable single-line output.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Filter directives (same syntax as `RUST_LOG`).
    #[serde(default)]
    pub log_filter: Option<String>,

    /// Whether to include the event target (module path).
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

fn default_with_target() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: None,
            with_target: default_with_target(),
        }
    }
}

impl TelemetryConfig {
    /// Builds the env filter for this configuration.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let directives = self.log_filter.as_deref().unwrap_or(DEFAULT_FILTER);
            EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        })
    }
}

/// Initialize the global tracing subscriber.
///
/// Fails if a global subscriber was already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> CourierResult<()> {
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let result = match config.log_format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    result.map_err(|e| CourierError::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::debug!(format = ?config.log_format, "Telemetry initialized");
    Ok(())
}
