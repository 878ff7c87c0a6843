use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::DownloadError;

/// Destination of a segment body.
#[async_trait]
pub trait SegmentSink: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError>;

    /// Flush and close the sink, returning the bytes written through it.
    async fn finish(self: Box<Self>) -> Result<u64, DownloadError>;

    /// Close the sink after a failed attempt. Bytes already written stay on disk.
    async fn abort(self: Box<Self>);
}

/// Writes straight into the destination file from the transfer task.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl FileSink {
    /// Open `path` for appending or truncate it, creating parent directories.
    pub async fn open(path: &Path, append: bool, capacity: usize) -> Result<Self, DownloadError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(capacity.max(1), file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SegmentSink for FileSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.writer.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, DownloadError> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_data().await?;
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) {
        if let Err(e) = self.writer.flush().await {
            warn!(path = %self.path.display(), error = %e, "Failed to flush aborted sink");
        }
    }
}

/// Hands chunks to a dedicated writer task over a bounded channel.
///
/// The transfer task only waits for disk I/O when the channel is full.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
    writer: Option<JoinHandle<Result<u64, DownloadError>>>,
}

impl ChannelSink {
    pub async fn open(
        path: &Path,
        append: bool,
        capacity: usize,
        depth: usize,
    ) -> Result<Self, DownloadError> {
        let sink = FileSink::open(path, append, capacity).await?;
        let (tx, mut rx) = mpsc::channel::<Bytes>(depth.max(1));

        let writer = tokio::spawn(async move {
            let mut sink = Box::new(sink);
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = sink.write(&chunk).await {
                    sink.abort().await;
                    return Err(e);
                }
            }
            sink.finish().await
        });

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Close the channel and wait for the writer task.
    async fn join(&mut self) -> Result<u64, DownloadError> {
        self.tx = None;
        let Some(writer) = self.writer.take() else {
            return Err(DownloadError::Internal {
                reason: "writer task already joined".to_string(),
            });
        };
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(DownloadError::Internal {
                reason: format!("writer task failed: {e}"),
            }),
        }
    }
}

#[async_trait]
impl SegmentSink for ChannelSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        let Some(tx) = &self.tx else {
            return Err(DownloadError::Internal {
                reason: "write after close".to_string(),
            });
        };
        if tx.send(Bytes::copy_from_slice(data)).await.is_ok() {
            return Ok(());
        }

        // The writer task exited early; surface its error.
        match self.join().await {
            Err(e) => Err(e),
            Ok(_) => Err(DownloadError::Internal {
                reason: "writer task exited before the body ended".to_string(),
            }),
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, DownloadError> {
        self.join().await
    }

    async fn abort(mut self: Box<Self>) {
        if self.writer.is_none() {
            return;
        }
        if let Err(e) = self.join().await {
            debug!(error = %e, "Writer task ended with error during abort");
        }
    }
}
