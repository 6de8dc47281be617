//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// Filter precedence: explicit `directives` argument, then `RUST_LOG`, then
/// `"info"`. Output is JSON with timestamps, suited to log shippers; use
/// `RUST_LOG` to widen per-crate levels in development.
pub fn init(directives: Option<&str>) {
    let filter = match directives {
        Some(d) => EnvFilter::new(d),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
