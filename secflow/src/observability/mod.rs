//! Log subscriber setup for the `secflow` binary.
//!
//! The library itself only emits through `tracing` macros; installing a
//! subscriber is left to the process edge.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset and no verbosity is requested.
pub const DEFAULT_FILTER: &str = "secflow=info";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Maps a `-v` count to the filter directive used without `RUST_LOG`.
#[must_use]
pub fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => DEFAULT_FILTER,
        1 => "secflow=debug",
        _ => "secflow=trace",
    }
}

/// Builds the filter: `RUST_LOG` wins, otherwise the verbosity level.
#[must_use]
pub fn env_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(verbosity)))
}

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for the run report.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(
    format: LogFormat,
    verbosity: u8,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(verbosity));
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    }
}
