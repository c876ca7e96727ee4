use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use dirs::home_dir;
use eyre::Result;
use figment::{providers::Serialized, value::Value};

use argus::{config::Config, runner::Runner, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose)?;

    let config = cli.to_config()?;
    tracing::info!(rpc_url = %config.rpc_url, "starting argus");

    if let Err(err) = Runner::from_config(config).run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }

    Ok(())
}

#[derive(Parser)]
pub struct Cli {
    /// Path to the TOML config file; defaults to ~/.argus/argus.toml
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// HTTP RPC endpoint of the chain node
    #[clap(long)]
    rpc_url: Option<String>,
    /// Interval between chain-head polls, in milliseconds
    #[clap(long)]
    poll_interval_ms: Option<u64>,
    /// Port to serve Prometheus metrics on
    #[clap(long)]
    metrics_port: Option<u16>,
    /// Contract address to watch; may be passed multiple times
    #[clap(short, long)]
    watch: Vec<String>,
    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

impl Cli {
    pub fn to_config(self) -> Result<Config> {
        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => home_dir()
                .ok_or(eyre::eyre!("home directory not found"))?
                .join(".argus/argus.toml"),
        };

        Config::new(&config_path, self.as_provider())
    }

    pub fn as_provider(&self) -> Serialized<HashMap<&str, Value>> {
        let mut user_dict = HashMap::new();

        if let Some(rpc_url) = &self.rpc_url {
            user_dict.insert("rpc_url", Value::from(rpc_url.clone()));
        }

        if let Some(poll_interval_ms) = self.poll_interval_ms {
            user_dict.insert("poll_interval_ms", Value::from(poll_interval_ms));
        }

        if let Some(metrics_port) = self.metrics_port {
            user_dict.insert("metrics_port", Value::from(metrics_port as u64));
        }

        if !self.watch.is_empty() {
            user_dict.insert("watch_addresses", Value::from(self.watch.clone()));
        }

        Serialized::defaults(user_dict)
    }
}
