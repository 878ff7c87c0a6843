use bytes::BytesMut;
use tracing::trace;

use super::sink::SegmentSink;
use crate::decryption::SegmentCipher;
use crate::error::DownloadError;
use crate::pool::BufferLease;

/// Staging buffer of a [`FileConsumer`].
#[derive(Debug)]
pub enum StagingBuffer {
    Pooled(BufferLease),
    Owned(BytesMut),
}

impl StagingBuffer {
    pub fn owned(capacity: usize) -> Self {
        Self::Owned(BytesMut::with_capacity(capacity))
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }

    fn append(&mut self, data: &[u8]) -> usize {
        match self {
            Self::Pooled(lease) => {
                let mut buf = lease.lock();
                buf.extend_from_slice(data);
                buf.len()
            }
            Self::Owned(buf) => {
                buf.extend_from_slice(data);
                buf.len()
            }
        }
    }

    fn take(&mut self) -> BytesMut {
        match self {
            Self::Pooled(lease) => std::mem::take(&mut *lease.lock()),
            Self::Owned(buf) => std::mem::take(buf),
        }
    }

    /// Hand an emptied buffer back, keeping its allocation.
    fn restore(&mut self, mut buf: BytesMut) {
        buf.clear();
        match self {
            Self::Pooled(lease) => *lease.lock() = buf,
            Self::Owned(slot) => *slot = buf,
        }
    }
}

/// Staged ciphertext at or above this size is decrypted on the blocking pool.
pub const DECRYPT_OFFLOAD_THRESHOLD: usize = 64 * 1024;

/// Streams a response body into a sink, decrypting on the way.
///
/// Chunks are staged and written once `flush_threshold` bytes accumulate.
/// Encrypted bodies are staged as ciphertext and decrypted per flush.
pub struct FileConsumer {
    sink: Box<dyn SegmentSink>,
    cipher: Option<SegmentCipher>,
    decrypting: bool,
    staging: StagingBuffer,
    scratch: Vec<u8>,
    flush_threshold: usize,
    offload_threshold: usize,
    written: u64,
}

impl FileConsumer {
    pub fn new(
        sink: Box<dyn SegmentSink>,
        cipher: Option<SegmentCipher>,
        staging: StagingBuffer,
        flush_threshold: usize,
    ) -> Self {
        Self {
            sink,
            decrypting: cipher.is_some(),
            cipher,
            staging,
            scratch: Vec::new(),
            flush_threshold: flush_threshold.max(1),
            offload_threshold: DECRYPT_OFFLOAD_THRESHOLD,
            written: 0,
        }
    }

    pub fn with_offload_threshold(mut self, threshold: usize) -> Self {
        self.offload_threshold = threshold;
        self
    }

    pub async fn consume(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        if self.staging.append(chunk) >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DownloadError> {
        let buf = self.staging.take();
        if buf.is_empty() {
            self.staging.restore(buf);
            return Ok(());
        }
        if !self.decrypting {
            let result = self.write(&buf).await;
            self.staging.restore(buf);
            return result;
        }

        let buf = self.decrypt(buf).await?;
        self.staging.restore(buf);
        let plaintext = std::mem::take(&mut self.scratch);
        let result = self.write(&plaintext).await;
        self.scratch = plaintext;
        result
    }

    /// Decrypt `buf` into the scratch buffer and hand `buf` back.
    async fn decrypt(&mut self, buf: BytesMut) -> Result<BytesMut, DownloadError> {
        let Some(mut cipher) = self.cipher.take() else {
            return Err(DownloadError::decryption("cipher already finalized"));
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();

        let (cipher, scratch, buf, result) = if buf.len() >= self.offload_threshold {
            trace!(bytes = buf.len(), "Decrypting on the blocking pool");
            tokio::task::spawn_blocking(move || {
                let result = cipher.update(&buf, &mut scratch);
                (cipher, scratch, buf, result)
            })
            .await
            .map_err(|e| DownloadError::decryption(format!("decryption task failed: {e}")))?
        } else {
            let result = cipher.update(&buf, &mut scratch);
            (cipher, scratch, buf, result)
        };

        self.cipher = Some(cipher);
        self.scratch = scratch;
        result.map(|()| buf)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        if data.is_empty() {
            return Ok(());
        }
        trace!(bytes = data.len(), "Flushing staged bytes");
        self.sink.write(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Plaintext bytes handed to the sink so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, finalize the cipher and close the sink.
    pub async fn finish(mut self) -> Result<u64, DownloadError> {
        if let Err(e) = self.finish_body().await {
            self.sink.abort().await;
            return Err(e);
        }
        self.sink.finish().await?;
        Ok(self.written)
    }

    async fn finish_body(&mut self) -> Result<(), DownloadError> {
        self.flush().await?;
        if let Some(cipher) = self.cipher.take() {
            let mut tail = std::mem::take(&mut self.scratch);
            tail.clear();
            cipher.finalize(&mut tail)?;
            self.write(&tail).await?;
        }
        Ok(())
    }

    /// Flush what is staged and close the sink, keeping the partial file.
    ///
    /// Staged ciphertext is dropped.
    pub async fn abort(mut self) {
        if !self.decrypting {
            let _ = self.flush().await;
        }
        self.sink.abort().await;
    }
}
