//! Prometheus Metrics Module.

use eyre::Result;
use lazy_static::lazy_static;
use prometheus_exporter::{
    prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge},
    start,
};

lazy_static! {
     /// Tracks the number of the cached chain head.
    pub static ref HEAD_BLOCK: IntGauge =
        register_int_gauge!("head_block", "cached chain head number").unwrap();
           /// Tracks how many blocks the chain cache currently holds.
    pub static ref CACHE_DEPTH: IntGauge =
        register_int_gauge!("cache_depth", "blocks held in the chain cache").unwrap();
           /// Counts the reorgs the engine has detected and repaired.
    pub static ref REORGS_DETECTED: IntCounter =
        register_int_counter!("reorgs_detected", "reorgs detected").unwrap();
           /// Counts the logs delivered to subscribers.
    pub static ref LOGS_DELIVERED: IntCounter =
        register_int_counter!("logs_delivered", "logs delivered to subscribers").unwrap();
           /// Tracks the number of registered subscriptions.
    pub static ref SUBSCRIPTIONS: IntGauge =
        register_int_gauge!("subscriptions", "registered subscriptions").unwrap();
}

/// Starts the metrics server on the given port
pub fn init(port: u16) -> Result<()> {
    match start(format!("0.0.0.0:{}", port).parse()?) {
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
