use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,tower_http=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Targets are kept in the output so `audit` events can be filtered and
/// shipped separately.
pub fn init() {
    let fmt_layer = fmt::layer().with_target(true);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
