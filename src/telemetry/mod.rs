//! Telemetry module
//!
//! This module encompasses telemetry for `argus`.
//!
//! ### Logging
//!
//! Logging is constructed using the [tracing](https://crates.io/crates/tracing) crate.
//! Use the [logging::init] function to register a global logger, passing in
//! a boolean `verbose` parameter. The function errors if a logger has
//! already been registered.
//!
//! ### Metrics
//!
//! Prometheus gauges and counters covering the cached head, the cache depth,
//! detected reorgs and delivered logs, exported via [metrics::init].

/// The Logging Module
pub mod logging;

/// Prometheus metrics
pub mod metrics;

// Re-export inner modules
pub use logging::*;
