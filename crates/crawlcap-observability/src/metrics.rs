use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Recording Metrics
    // ============================================================================

    /// Bytes captured by recording sessions, split by storage tier
    pub static ref RECORDED_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("crawlcap_recorded_bytes_total", "Total bytes recorded"),
        &["tier"] // memory, disk
    ).expect("metric can be created");

    /// Backing files currently on disk
    pub static ref BACKING_FILES_LIVE: IntGauge = IntGauge::new(
        "crawlcap_backing_files_live",
        "Backing files not yet deleted"
    ).expect("metric can be created");

    /// Replay readers constructed
    pub static ref REPLAY_READERS_OPENED_TOTAL: IntCounter = IntCounter::new(
        "crawlcap_replay_readers_opened_total",
        "Total replay readers opened"
    ).expect("metric can be created");

    // ============================================================================
    // Archive Metrics
    // ============================================================================

    /// Gzip members whose header was read
    pub static ref GZIP_MEMBERS_READ_TOTAL: IntCounter = IntCounter::new(
        "crawlcap_gzip_members_read_total",
        "Total gzip members read"
    ).expect("metric can be created");

    /// Gzip members rejected as malformed
    pub static ref GZIP_MALFORMED_MEMBERS_TOTAL: IntCounter = IntCounter::new(
        "crawlcap_gzip_malformed_members_total",
        "Total malformed gzip members"
    ).expect("metric can be created");

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Items written to a disk tail instead of the memory head
    pub static ref QUEUE_SPILLED_TOTAL: IntCounter = IntCounter::new(
        "crawlcap_queue_spilled_total",
        "Total queue items spilled to disk"
    ).expect("metric can be created");

    /// Items moved from a disk tail back into the memory head
    pub static ref QUEUE_REFILLED_TOTAL: IntCounter = IntCounter::new(
        "crawlcap_queue_refilled_total",
        "Total queue items refilled from disk"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(RECORDED_BYTES_TOTAL.clone()))
            .expect("recorded_bytes_total can be registered");
        REGISTRY
            .register(Box::new(BACKING_FILES_LIVE.clone()))
            .expect("backing_files_live can be registered");
        REGISTRY
            .register(Box::new(REPLAY_READERS_OPENED_TOTAL.clone()))
            .expect("replay_readers_opened_total can be registered");
        REGISTRY
            .register(Box::new(GZIP_MEMBERS_READ_TOTAL.clone()))
            .expect("gzip_members_read_total can be registered");
        REGISTRY
            .register(Box::new(GZIP_MALFORMED_MEMBERS_TOTAL.clone()))
            .expect("gzip_malformed_members_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_SPILLED_TOTAL.clone()))
            .expect("queue_spilled_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_REFILLED_TOTAL.clone()))
            .expect("queue_refilled_total can be registered");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    init();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
