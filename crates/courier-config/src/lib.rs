//! # Courier Config
//!
//! Layered configuration for the Courier worker queue: TOML files, then
//! `COURIER__SECTION__KEY` environment variables, validated at load time.

mod app_config;
mod loader;
mod validation;

pub use app_config::*;
pub use loader::*;
pub use validation::*;
