use eyre::Result;
use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Configure logging telemetry
pub fn init(verbose: bool) -> Result<()> {
    let subscriber = match verbose {
        true => get_subscriber("argus=debug".into()),
        false => get_subscriber("argus=info".into()),
    };
    init_subscriber(subscriber)
}

/// Subscriber Composer
///
/// Builds a subscriber with an env filter and a fmt layer into a
/// [tracing](https://crates.io/crates/tracing) subscriber. The `RUST_LOG`
/// environment variable overrides the provided filter.
pub fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    let formatting_layer = fmt::layer().with_target(true);
    Registry::default().with(env_filter).with(formatting_layer)
}

/// Globally registers a subscriber.
/// This will error if a subscriber has already been registered.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) -> Result<()> {
    set_global_default(subscriber).map_err(|_| eyre::eyre!("Failed to set subscriber"))
}
