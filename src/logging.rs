//! Subscriber setup for binaries embedding the runtime.
//!
//! The level comes from the `TSUMIKI_LOG` environment variable, using the
//! usual `EnvFilter` directives, and defaults to `info`. Batch progress bars
//! are drawn by `tracing-indicatif` on stderr, log lines are routed through
//! the same writer so they do not tear the bars.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber, fails if one is already installed.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("TSUMIKI_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif.get_stderr_writer())
                .with_target(true)
                .with_thread_names(true),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
