//! Configuration for the argus binary and engine.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use alloy_primitives::Address;
use eyre::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    value::Value,
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::engine::EngineOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP RPC endpoint of the chain node
    pub rpc_url: String,
    /// Interval between chain-head polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Port the Prometheus metrics server binds to; disabled when unset
    pub metrics_port: Option<u16>,
    /// Contract addresses the binary subscribes to on startup
    pub watch_addresses: Vec<Address>,
    /// Engine tuning
    pub engine: EngineOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            poll_interval_ms: 2_000,
            metrics_port: None,
            watch_addresses: Vec::new(),
            engine: EngineOptions::default(),
        }
    }
}

impl Config {
    /// Builds the configuration by merging, in increasing priority: built-in
    /// defaults, the TOML file at `config_path`, `ARGUS_`-prefixed
    /// environment variables, and CLI-supplied values.
    pub fn new(
        config_path: &Path,
        cli_provider: Serialized<HashMap<&str, Value>>,
    ) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("ARGUS_").split("__"))
            .merge(cli_provider)
            .extract()
            .map_err(|err| eyre::eyre!("invalid config: {}", err))?;

        config.engine.validate()?;
        Ok(config)
    }

    /// The chain-head poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
