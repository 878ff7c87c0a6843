use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Transfer metrics of a [`TransferManager`](crate::TransferManager).
///
/// All counters use relaxed atomics; values are advisory.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    // Request metrics
    /// HTTP requests sent, including client-level retries
    pub requests_total: AtomicU64,
    /// Client-level request retries
    pub request_retries: AtomicU64,
    /// Whole-transfer attempts retried after backoff
    pub transfer_retries: AtomicU64,

    // Resume metrics
    /// Transfers that continued a partial file with a ranged request
    pub resumes: AtomicU64,
    /// Ranged requests answered with a full body
    pub restarts: AtomicU64,
    /// Transfers skipped because the local file was already complete
    pub skipped: AtomicU64,

    // Outcome metrics
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    /// Body bytes received from the network
    pub bytes_received: AtomicU64,
    /// Bytes written to sinks after decryption
    pub bytes_written: AtomicU64,
    /// Sum of completed transfer durations in milliseconds
    pub transfer_time_sum_ms: AtomicU64,

    // Buffer metrics
    pub pooled_buffers: AtomicU64,
    pub owned_buffers: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_retry(&self) {
        self.request_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer_retry(&self) {
        self.transfer_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resume(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed transfer
    pub fn record_completed(&self, written: u64, duration_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
        self.transfer_time_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_buffer(&self, pooled: bool) {
        if pooled {
            self.pooled_buffers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.owned_buffers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get average throughput of completed transfers in bytes per second
    ///
    /// Returns None if no transfer time has been recorded
    pub fn average_throughput(&self) -> Option<f64> {
        let bytes = self.bytes_written.load(Ordering::Relaxed);
        let total_ms = self.transfer_time_sum_ms.load(Ordering::Relaxed);
        if total_ms == 0 {
            return None;
        }
        Some(bytes as f64 / (total_ms as f64 / 1000.0))
    }

    pub fn snapshot(&self) -> TransferMetricsSnapshot {
        TransferMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            request_retries: self.request_retries.load(Ordering::Relaxed),
            transfer_retries: self.transfer_retries.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            transfer_time_sum_ms: self.transfer_time_sum_ms.load(Ordering::Relaxed),
            pooled_buffers: self.pooled_buffers.load(Ordering::Relaxed),
            owned_buffers: self.owned_buffers.load(Ordering::Relaxed),
        }
    }

    /// Log a transfer summary using tracing
    pub fn log_summary(&self) {
        let s = self.snapshot();
        let throughput = self
            .average_throughput()
            .map(format_bytes_per_sec)
            .unwrap_or_else(|| "N/A".to_string());

        info!(
            requests = s.requests_total,
            request_retries = s.request_retries,
            transfer_retries = s.transfer_retries,
            resumes = s.resumes,
            restarts = s.restarts,
            skipped = s.skipped,
            completed = s.completed,
            failed = s.failed,
            cancelled = s.cancelled,
            bytes_received = s.bytes_received,
            bytes_written = s.bytes_written,
            avg_throughput = %throughput,
            pooled_buffers = s.pooled_buffers,
            owned_buffers = s.owned_buffers,
            "Transfer summary"
        );
    }
}

/// A point-in-time snapshot of all transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferMetricsSnapshot {
    pub requests_total: u64,
    pub request_retries: u64,
    pub transfer_retries: u64,
    pub resumes: u64,
    pub restarts: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_received: u64,
    pub bytes_written: u64,
    pub transfer_time_sum_ms: u64,
    pub pooled_buffers: u64,
    pub owned_buffers: u64,
}

/// Format bytes per second in human-readable form
fn format_bytes_per_sec(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bytes_per_sec / 1_000_000_000.0)
    } else if bytes_per_sec >= 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{bytes_per_sec:.2} B/s")
    }
}
