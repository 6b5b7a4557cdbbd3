//! # Courier Core
//!
//! Error types, result aliases and tracing setup shared by the Courier
//! worker queue crates.

pub mod error;
pub mod result;
pub mod telemetry;

pub use error::*;
pub use result::*;
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig};
