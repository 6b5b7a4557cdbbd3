//! # Courier Server Library
//!
//! Command-line parsing, component wiring and process startup for the
//! `courier` binary.

pub mod app;
pub mod cli;
pub mod startup;
