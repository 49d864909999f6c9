use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Initializes the process-wide tracing subscriber.
///
/// `directives` follows the `tracing_subscriber::EnvFilter` syntax and
/// defaults to `info`; the `ASTER_LOG` environment variable overrides both.
pub fn init(directives: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("ASTER_LOG")
        .or_else(|_| EnvFilter::try_new(directives.unwrap_or("info")))
        .context("invalid log filter directives")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to set global subscriber: {error}"))
}
