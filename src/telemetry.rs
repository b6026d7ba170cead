//! Logging setup.
//!
//! Installs a `tracing_subscriber` registry with an `EnvFilter` taken from
//! `RUST_LOG` (default `adflow=info`) and a pretty or JSON formatting layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

const DEFAULT_FILTER: &str = "adflow=info";

/// Initialize logging.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    let layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_filter(filter())
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init().is_ok()
}
