//! crawlcap Observability
//!
//! Provides metrics and logging for the capture, archive and queue layers.
//!
//! # Features
//!
//! - Prometheus metrics (recorded bytes by tier, replay readers, gzip members,
//!   queue spills and refills)
//! - Structured logging with tracing
//!
//! # Usage
//!
//! ```no_run
//! use crawlcap_observability::{logging, metrics};
//!
//! logging::init();
//! metrics::init();
//!
//! println!("{}", metrics::gather_text());
//! ```

pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use metrics::{gather_text, init as init_metrics, REGISTRY};

/// Initialize all observability components
pub fn init() {
    metrics::init();
    logging::init();
}
