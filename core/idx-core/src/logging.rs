//! Tracing setup for embedded use.
//!
//! IDX is a library: nothing installs a subscriber implicitly. A host
//! application either brings its own subscriber or calls one of these
//! helpers. Filters are scoped to this crate so the host's own spans are
//! left alone. With the `logging` feature off everything compiles to a
//! no-op.

#[cfg(feature = "logging")]
use tracing_subscriber::{EnvFilter, fmt};

/// Install a compact subscriber filtered to this crate.
///
/// The filter directive is resolved in order: the `IDX_LOG` environment
/// variable, then `RUST_LOG`, then `idx_core=<level>`.
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    let filter = std::env::var("IDX_LOG")
        .map(EnvFilter::new)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("idx_core={level}")));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// [`init_with_level`] at `info`.
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Subscriber for tests: everything this crate emits, routed through the
/// test harness's capture. Safe to call from every test — installing
/// twice is a no-op.
#[cfg(feature = "logging")]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("idx_core=trace"))
        .with_test_writer()
        .try_init();
}

// No-op stubs when the logging feature is off.
#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_test_is_idempotent() {
        init_test();
        init_test();
    }
}
