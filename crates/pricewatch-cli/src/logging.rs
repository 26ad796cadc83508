use anyhow::anyhow;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub const DEFAULT_FILTER: &str = "info,chromiumoxide=warn";
pub const VERBOSE_FILTER: &str = "info,pricewatch_core=debug,pricewatch_cli=debug,chromiumoxide=warn";

pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over the built-in filter.
pub fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
