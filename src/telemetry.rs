//! Logging setup
//!
//! The engine logs through `tracing`: one span per test, structured fields
//! for steps, operations and resources. Install a subscriber once per
//! process to see the output.
//!
//! # Example
//!
//! ```no_run
//! use kuvio::telemetry::init_logging;
//!
//! init_logging();
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Install a stderr subscriber filtered by `RUST_LOG` (default: info)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    init_logging_with(DEFAULT_FILTER);
}

/// Install a stderr subscriber, falling back to `directives` when
/// `RUST_LOG` is unset or invalid
pub fn init_logging_with(directives: &str) {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
