use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use segfetch_engine::{
    BatchReport, BatchReporter, DownloadError, DownloadReport, MediaDownload,
};

use crate::error::Result;

/// Logs one line per finished segment with a running count.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl BatchReporter for ProgressReporter {
    fn download_started(&self, download: &MediaDownload) {
        self.total
            .fetch_add(download.segment_count(), Ordering::Relaxed);
        info!(
            playlist = %download.source,
            segments = download.segment_count(),
            "Downloading segments"
        );
    }

    fn segment_completed(&self, _download: &MediaDownload, index: usize, dest: &Path) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "[{done}/{}] segment {index} -> {}",
            self.total.load(Ordering::Relaxed),
            dest.display()
        );
    }

    fn segment_failed(&self, _download: &MediaDownload, index: usize, error: &DownloadError) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "[{done}/{}] segment {index} failed: {error}",
            self.total.load(Ordering::Relaxed)
        );
    }

    fn download_finished(&self, report: &DownloadReport) {
        if report.skipped > 0 {
            warn!(skipped = report.skipped, "Download stopped before every segment finished");
        }
    }

    fn batch_finished(&self, report: &BatchReport) {
        let metrics = &report.metrics;
        info!(
            status = ?report.status,
            completed = report.completed_segments(),
            failed = report.failed_segments(),
            resumed = metrics.resumes,
            skipped_existing = metrics.skipped,
            retries = metrics.transfer_retries,
            bytes = metrics.bytes_written,
            elapsed = ?report.elapsed,
            "Batch finished"
        );
    }
}

/// Append every segment, in playlist order, to `output`.
pub async fn concat(segments: &[PathBuf], output: &Path) -> Result<u64> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut writer = BufWriter::new(File::create(output).await?);
    let mut total = 0;
    for segment in segments {
        let mut reader = File::open(segment).await?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    info!(output = %output.display(), bytes = total, segments = segments.len(), "Segments concatenated");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn concat_preserves_order() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("{i}.ts"))).collect();
        for (i, path) in paths.iter().enumerate() {
            std::fs::write(path, vec![b'a' + i as u8; 4]).unwrap();
        }
        let output = dir.path().join("joined/all.ts");

        let written = concat(&paths, &output).await.unwrap();
        assert_eq!(written, 12);
        assert_eq!(std::fs::read(&output).unwrap(), b"aaaabbbbcccc");
    }

    #[tokio::test]
    async fn concat_fails_on_missing_segment() {
        let dir = TempDir::new().unwrap();
        let result = concat(&[dir.path().join("none.ts")], &dir.path().join("out.ts")).await;
        assert!(result.is_err());
    }
}
