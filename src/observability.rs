use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

/// Output format for structured logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for local development.
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set; otherwise the crate logs at
/// `info` and everything else at `warn`. Call once at startup; a second call
/// reports an error instead of panicking so embedding applications that
/// already installed a subscriber keep theirs.
pub fn setup_logs(format: LogFormat) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gatekeeper=info"));

    let fmt_layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| {
            Error::new_without_logging(ErrorDetails::InternalError {
                message: format!("Failed to initialize logging: {e}"),
            })
        })
}
