use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DEFAULT_LOG_FILTER, LoggingConfig};

/// Initialize structured logging.
///
/// - `EnvFilter` honours `RUST_LOG` first, then the configured filter.
/// - Output goes to stderr so stdout stays free for assembled conversations.
/// - `json = true` switches the `fmt` layer to newline-delimited JSON.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let compact_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init()
}
