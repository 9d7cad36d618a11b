//! Logging setup shared by the crawlcap binaries.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    init_with_default("info");
}

/// Same as [`init`] with a caller-chosen fallback directive.
pub fn init_with_default(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_target(false)
        .try_init();
}
