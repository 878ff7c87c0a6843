use bytes::{Bytes, BytesMut};

use crate::error::DownloadError;

/// Collects a whole response body in memory, up to a size limit.
#[derive(Debug)]
pub struct BytesConsumer {
    buf: BytesMut,
    limit: usize,
}

impl BytesConsumer {
    /// `size_hint` pre-sizes the buffer when the body length is known.
    pub fn new(limit: usize, size_hint: Option<u64>) -> Result<Self, DownloadError> {
        let initial = match size_hint {
            Some(len) if len > limit as u64 => {
                return Err(DownloadError::BodyTooLarge { limit });
            }
            Some(len) => len as usize,
            None => 0,
        };
        Ok(Self {
            buf: BytesMut::with_capacity(initial),
            limit,
        })
    }

    pub fn consume(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(DownloadError::BodyTooLarge { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_chunks() {
        let mut consumer = BytesConsumer::new(16, None).unwrap();
        consumer.consume(b"#EXTM3U\n").unwrap();
        consumer.consume(b"#EXT").unwrap();
        assert_eq!(consumer.finish(), Bytes::from_static(b"#EXTM3U\n#EXT"));
    }

    #[test]
    fn enforces_limit() {
        let mut consumer = BytesConsumer::new(4, None).unwrap();
        consumer.consume(b"abcd").unwrap();
        assert!(matches!(
            consumer.consume(b"e"),
            Err(DownloadError::BodyTooLarge { limit: 4 })
        ));
        assert!(BytesConsumer::new(4, Some(5)).is_err());
    }
}
