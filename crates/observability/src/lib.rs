//! Tracing and logging setup shared by worker and scheduler binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(None);
}

/// Initialize with an explicit filter directive (e.g. `"pagesmith=debug"`),
/// overriding `RUST_LOG`. Intended for tests and one-off tooling.
pub fn init_with_filter(directives: &str) {
    tracing::init(Some(directives));
}

/// Tracing configuration (filters, layers).
pub mod tracing;
