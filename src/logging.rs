//! Ready-made `tracing` subscriber for binaries embedding the task graph.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset, e.g. `reactask=debug`.
    pub level: String,
    /// Colorize the output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            ansi: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to install the subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

fn filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => Ok(EnvFilter::from_default_env()),
        _ => Ok(EnvFilter::try_new(&config.level)?),
    }
}

/// Installs a global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over [`LogConfig::level`].
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = filter(config)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi),
        )
        .try_init()?;

    Ok(())
}
