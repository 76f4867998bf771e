//! Tracing subscriber setup for applications embedding the reader engine

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a formatted tracing subscriber
///
/// The filter comes from `RUST_LOG` when set, otherwise `default_filter`
/// (for example `"reader_core=debug,reader_cache=info"`). Returns `false`
/// if a global subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
