//! Prometheus-based metrics module
//!
//! Frame-path counters shared by the client and server. Nothing is served
//! over HTTP; the runtime logs a summary periodically and dumps the full text
//! exposition on shutdown.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Link Metrics ===

    /// Frames written to a link socket
    pub static ref FRAMES_SENT: IntCounter = IntCounter::new(
        "scatter_frames_sent_total",
        "Total number of frames written to links"
    ).unwrap();

    /// Frames parsed from a link socket
    pub static ref FRAMES_RECEIVED: IntCounter = IntCounter::new(
        "scatter_frames_received_total",
        "Total number of frames parsed from links"
    ).unwrap();

    /// Bytes discarded while resynchronizing the parser
    pub static ref RESYNC_BYTES_SKIPPED: IntCounter = IntCounter::new(
        "scatter_resync_bytes_skipped_total",
        "Total bytes skipped while searching for a valid frame header"
    ).unwrap();

    /// Frames that failed to decrypt or authenticate
    pub static ref DECRYPT_FAILURES: IntCounter = IntCounter::new(
        "scatter_decrypt_failures_total",
        "Total number of frames dropped after a decrypt failure"
    ).unwrap();

    /// Frames dropped on a full queue or lost with a failed link
    pub static ref QUEUE_DROPS: IntCounter = IntCounter::new(
        "scatter_queue_drops_total",
        "Total number of outbound frames dropped before reaching the wire"
    ).unwrap();

    /// Client link reconnect attempts
    pub static ref LINK_RECONNECTS: IntCounter = IntCounter::new(
        "scatter_link_reconnects_total",
        "Total number of link reconnect attempts"
    ).unwrap();

    /// Currently connected links
    pub static ref LINKS_ACTIVE: IntGauge = IntGauge::new(
        "scatter_links_active",
        "Number of currently connected links"
    ).unwrap();

    // === Reassembly Metrics ===

    /// Blocks completed with every data shard present
    pub static ref BLOCKS_COMPLETED: IntCounter = IntCounter::new(
        "scatter_blocks_completed_total",
        "Total number of blocks reassembled"
    ).unwrap();

    /// Blocks completed by parity recovery
    pub static ref BLOCKS_RECOVERED: IntCounter = IntCounter::new(
        "scatter_blocks_recovered_total",
        "Total number of blocks completed by rebuilding a shard from parity"
    ).unwrap();

    /// Shard copies ignored because the index was already present
    pub static ref DUPLICATES_IGNORED: IntCounter = IntCounter::new(
        "scatter_duplicate_shards_total",
        "Total number of duplicate shards ignored"
    ).unwrap();

    // === Session Metrics ===

    /// Sessions opened (client) or connectors created (server)
    pub static ref SESSIONS_OPENED: IntCounter = IntCounter::new(
        "scatter_sessions_opened_total",
        "Total number of sessions opened"
    ).unwrap();

    /// Sessions currently registered
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "scatter_sessions_active",
        "Number of currently registered sessions"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(FRAMES_SENT.clone())).ok();
    REGISTRY.register(Box::new(FRAMES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(RESYNC_BYTES_SKIPPED.clone())).ok();
    REGISTRY.register(Box::new(DECRYPT_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(QUEUE_DROPS.clone())).ok();
    REGISTRY.register(Box::new(LINK_RECONNECTS.clone())).ok();
    REGISTRY.register(Box::new(LINKS_ACTIVE.clone())).ok();

    REGISTRY.register(Box::new(BLOCKS_COMPLETED.clone())).ok();
    REGISTRY.register(Box::new(BLOCKS_RECOVERED.clone())).ok();
    REGISTRY.register(Box::new(DUPLICATES_IGNORED.clone())).ok();

    REGISTRY.register(Box::new(SESSIONS_OPENED.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
}

/// Prometheus text exposition of every registered metric
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// One-line summary for periodic logging
pub fn summary() -> String {
    format!(
        "links={} sessions={} (opened {}) frames tx={} rx={} blocks={} recovered={} dup={} resync={} decrypt_fail={} dropped={} reconnects={}",
        LINKS_ACTIVE.get(),
        SESSIONS_ACTIVE.get(),
        SESSIONS_OPENED.get(),
        FRAMES_SENT.get(),
        FRAMES_RECEIVED.get(),
        BLOCKS_COMPLETED.get(),
        BLOCKS_RECOVERED.get(),
        DUPLICATES_IGNORED.get(),
        format_bytes(RESYNC_BYTES_SKIPPED.get()),
        DECRYPT_FAILURES.get(),
        QUEUE_DROPS.get(),
        LINK_RECONNECTS.get(),
    )
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
