//! Response consumers: in-memory collection and streaming to a file sink.

mod bytes;
mod file;
mod sink;

pub use self::bytes::BytesConsumer;
pub use file::{DECRYPT_OFFLOAD_THRESHOLD, FileConsumer, StagingBuffer};
pub use sink::{ChannelSink, FileSink, SegmentSink};

use std::path::Path;

use crate::error::DownloadError;

/// Chunks queued between a transfer and its writer task.
pub const CHANNEL_SINK_DEPTH: usize = 8;

/// How a transfer hands bytes to the file system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SinkMode {
    /// Write from the transfer task.
    #[default]
    Direct,
    /// Write from a dedicated task fed over a channel.
    Channel,
}

impl SinkMode {
    pub async fn open(
        self,
        path: &Path,
        append: bool,
        capacity: usize,
    ) -> Result<Box<dyn SegmentSink>, DownloadError> {
        Ok(match self {
            SinkMode::Direct => Box::new(FileSink::open(path, append, capacity).await?),
            SinkMode::Channel => Box::new(
                ChannelSink::open(path, append, capacity, CHANNEL_SINK_DEPTH).await?,
            ),
        })
    }
}
