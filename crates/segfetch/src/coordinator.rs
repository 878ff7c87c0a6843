//! Batch orchestration: runs downloads with bounded concurrency and reports
//! a completed or stopped status.

use futures::{StreamExt, stream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{DownloadError, ErrorKind};
use crate::events::{BatchReporter, NoopListener, TransferListener};
use crate::metrics::TransferMetricsSnapshot;
use crate::options::{FixedNumberOptionsSelector, TransferOptions};
use crate::pool::BufferPool;
use crate::segment::{MediaDownload, SegmentDescriptor};
use crate::transfer::{TransferManager, TransferStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Every download ran to the end; some segments may still have failed.
    Completed,
    /// The batch was cancelled or the manager shut down.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SegmentFailure {
    pub index: usize,
    pub uri: Url,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub id: String,
    pub completed: usize,
    /// Segments never finished because the batch stopped
    pub skipped: usize,
    pub failures: Vec<SegmentFailure>,
    pub options: TransferOptions,
}

impl DownloadReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub downloads: Vec<DownloadReport>,
    pub elapsed: Duration,
    pub metrics: TransferMetricsSnapshot,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed && self.downloads.iter().all(DownloadReport::is_success)
    }

    pub fn completed_segments(&self) -> usize {
        self.downloads.iter().map(|d| d.completed).sum()
    }

    pub fn failed_segments(&self) -> usize {
        self.downloads.iter().map(|d| d.failures.len()).sum()
    }
}

enum SegmentOutcome {
    Completed,
    Skipped,
    Failed(SegmentFailure),
}

/// Runs batches of downloads through one [`TransferManager`].
pub struct DownloadCoordinator {
    manager: Arc<TransferManager>,
    buffers: BufferPool,
    listener: Arc<dyn TransferListener>,
}

impl DownloadCoordinator {
    pub fn new(manager: Arc<TransferManager>) -> Self {
        let buffers = BufferPool::new(manager.config());
        Self {
            manager,
            buffers,
            listener: Arc::new(NoopListener),
        }
    }

    /// Receive per-transfer progress for every segment of every batch.
    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn manager(&self) -> &Arc<TransferManager> {
        &self.manager
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Run `batch` until every download finishes or `token` is cancelled.
    #[instrument(skip_all, fields(downloads = batch.len()))]
    pub async fn run(
        &self,
        batch: Vec<MediaDownload>,
        token: CancellationToken,
        reporter: &dyn BatchReporter,
    ) -> BatchReport {
        let started = Instant::now();
        let config = self.manager.config();
        let selector =
            FixedNumberOptionsSelector::new(&batch, config, self.buffers.min_allocation());
        let segments: usize = batch.iter().map(MediaDownload::segment_count).sum();
        info!(
            downloads = batch.len(),
            segments,
            executor_threads = config.executor_threads,
            "Starting batch"
        );

        let selector = &selector;
        let token_ref = &token;
        let work = stream::iter(batch.iter())
            .map(|download| self.run_download(download, selector, token_ref, reporter))
            .buffer_unordered(config.executor_threads.max(1))
            .collect::<Vec<_>>();
        tokio::pin!(work);

        let downloads = tokio::select! {
            downloads = &mut work => downloads,
            _ = token.cancelled() => {
                debug!("Batch cancelled, waiting for transfers to stop");
                work.await
            }
        };

        let status = if token.is_cancelled() || self.manager.is_shut_down() {
            BatchStatus::Stopped
        } else {
            BatchStatus::Completed
        };
        let report = BatchReport {
            status,
            downloads,
            elapsed: started.elapsed(),
            metrics: self.manager.metrics().snapshot(),
        };
        info!(
            status = ?report.status,
            completed = report.completed_segments(),
            failed = report.failed_segments(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch finished"
        );
        reporter.batch_finished(&report);
        report
    }

    async fn run_download(
        &self,
        download: &MediaDownload,
        selector: &FixedNumberOptionsSelector,
        token: &CancellationToken,
        reporter: &dyn BatchReporter,
    ) -> DownloadReport {
        reporter.download_started(download);
        let snapshot = selector.snapshot();
        let pending = download.segment_count();
        let options = selector.decide(download, pending);
        snapshot.segments_queued(pending);

        let mut strategy = TransferStrategy::new(token.clone()).with_sink(options.sink_mode());
        if options.use_buffer_pool {
            strategy = strategy.with_buffers(self.buffers.coterie());
        }
        debug!(download = %download.id, ?options, "Transfer options chosen");

        let strategy = &strategy;
        let per_route = self.manager.config().max_connections_per_route.max(1);
        let outcomes = stream::iter(download.segments.iter().enumerate())
            .map(|(index, segment)| async move {
                if token.is_cancelled() {
                    snapshot.segment_finished(false);
                    return SegmentOutcome::Skipped;
                }
                snapshot.segment_started();
                let result = self.run_segment(segment, strategy).await;
                snapshot.segment_finished(true);
                match result {
                    Ok(Some(path)) => {
                        reporter.segment_completed(download, index, &path);
                        SegmentOutcome::Completed
                    }
                    Ok(None) | Err(DownloadError::Cancelled | DownloadError::Shutdown) => {
                        SegmentOutcome::Skipped
                    }
                    Err(e) => {
                        reporter.segment_failed(download, index, &e);
                        SegmentOutcome::Failed(SegmentFailure {
                            index,
                            uri: segment.uri.clone(),
                            kind: e.kind(),
                            message: e.to_string(),
                        })
                    }
                }
            })
            .buffer_unordered(per_route)
            .collect::<Vec<_>>()
            .await;
        selector.finish(download);

        let mut report = DownloadReport {
            id: download.id.clone(),
            completed: 0,
            skipped: 0,
            failures: Vec::new(),
            options,
        };
        for outcome in outcomes {
            match outcome {
                SegmentOutcome::Completed => report.completed += 1,
                SegmentOutcome::Skipped => report.skipped += 1,
                SegmentOutcome::Failed(failure) => report.failures.push(failure),
            }
        }
        report.failures.sort_by_key(|f| f.index);
        reporter.download_finished(&report);
        report
    }

    async fn run_segment(
        &self,
        segment: &SegmentDescriptor,
        strategy: &TransferStrategy,
    ) -> Result<Option<std::path::PathBuf>, DownloadError> {
        self.manager
            .download_file_with(
                &segment.uri,
                &segment.dest,
                segment.key.as_deref(),
                &segment.request,
                self.listener.as_ref(),
                strategy,
            )
            .await
    }
}

/// Cancel `token` once the externally owned running flag turns false.
///
/// The task ends when the token fires or the flag's sender is dropped.
pub fn supervise(mut running: watch::Receiver<bool>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !*running.borrow_and_update() {
                info!("Running flag cleared, cancelling batch");
                token.cancel();
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                changed = running.changed() => {
                    if changed.is_err() {
                        debug!("Running flag sender dropped, supervisor exiting");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervisor_cancels_when_flag_clears() {
        let (tx, rx) = watch::channel(true);
        let token = CancellationToken::new();
        let handle = supervise(rx, token.clone());

        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());

        tx.send(false).unwrap();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn supervisor_exits_with_token() {
        let (_tx, rx) = watch::channel(true);
        let token = CancellationToken::new();
        let handle = supervise(rx, token.clone());
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn supervisor_cancels_immediately_when_not_running() {
        let (_tx, rx) = watch::channel(false);
        let token = CancellationToken::new();
        supervise(rx, token.clone()).await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn report_success_requires_clean_downloads() {
        let download = DownloadReport {
            id: "a".into(),
            completed: 3,
            skipped: 0,
            failures: Vec::new(),
            options: TransferOptions::default(),
        };
        let mut report = BatchReport {
            status: BatchStatus::Completed,
            downloads: vec![download],
            elapsed: Duration::ZERO,
            metrics: TransferMetricsSnapshot::default(),
        };
        assert!(report.is_success());
        assert_eq!(report.completed_segments(), 3);

        report.status = BatchStatus::Stopped;
        assert!(!report.is_success());
    }
}
