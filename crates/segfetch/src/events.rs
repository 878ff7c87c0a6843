use std::path::Path;
use tracing::{debug, info, warn};
use url::Url;

use crate::coordinator::{BatchReport, DownloadReport};
use crate::error::DownloadError;
use crate::segment::MediaDownload;

/// Per-transfer progress callbacks invoked by the transfer manager.
///
/// Callbacks run inline on the transfer task and must not block.
pub trait TransferListener: Send + Sync {
    /// The body started streaming; `offset` is non-zero when resuming.
    fn on_started(&self, _uri: &Url, _offset: u64, _total: Option<u64>) {}

    /// `received` counts bytes stored so far, including the resume offset.
    fn on_progress(&self, _uri: &Url, _received: u64, _total: Option<u64>) {}

    fn on_completed(&self, _uri: &Url, _dest: &Path, _bytes: u64) {}

    /// The transfer gave up. Cancellation is not reported here.
    fn on_failed(&self, _uri: &Url, _error: &DownloadError) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TransferListener for NoopListener {}

/// Batch-level callbacks for UI display.
pub trait BatchReporter: Send + Sync {
    fn download_started(&self, _download: &MediaDownload) {}

    fn segment_completed(&self, _download: &MediaDownload, _index: usize, _dest: &Path) {}

    fn segment_failed(&self, _download: &MediaDownload, _index: usize, _error: &DownloadError) {}

    fn download_finished(&self, _report: &DownloadReport) {}

    fn batch_finished(&self, _report: &BatchReport) {}
}

/// Reporter that writes every event to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl BatchReporter for TracingReporter {
    fn download_started(&self, download: &MediaDownload) {
        info!(
            download = %download.id,
            segments = download.segment_count(),
            "Download started"
        );
    }

    fn segment_completed(&self, download: &MediaDownload, index: usize, dest: &Path) {
        debug!(download = %download.id, index, dest = %dest.display(), "Segment completed");
    }

    fn segment_failed(&self, download: &MediaDownload, index: usize, error: &DownloadError) {
        warn!(download = %download.id, index, error = %error, "Segment failed");
    }

    fn download_finished(&self, report: &DownloadReport) {
        info!(
            download = %report.id,
            completed = report.completed,
            failed = report.failures.len(),
            skipped = report.skipped,
            "Download finished"
        );
    }

    fn batch_finished(&self, report: &BatchReport) {
        info!(
            status = ?report.status,
            downloads = report.downloads.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch finished"
        );
    }
}
