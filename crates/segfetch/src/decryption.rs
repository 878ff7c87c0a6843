// Segment Decryption: AES-128-CBC keys and an incremental cipher applied to streamed bytes.

use aes::Aes128;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use std::fmt;

use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

/// Name of the only supported method, as it appears in playlists.
pub const METHOD_AES_128: &str = "AES-128";

/// Key material for one encrypted segment.
///
/// Each call to [`DecryptionKey::cipher`] creates an independent cipher
/// state, so one key can be shared by concurrent segments.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptionKey {
    key: [u8; 16],
    iv: [u8; 16],
    method: String,
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("method", &self.method)
            .field("iv", &hex::encode(self.iv))
            .finish_non_exhaustive()
    }
}

impl DecryptionKey {
    pub fn new(key: &[u8], iv: [u8; 16], method: impl Into<String>) -> Result<Self, DownloadError> {
        let method = method.into();
        if !method.eq_ignore_ascii_case(METHOD_AES_128) {
            return Err(DownloadError::decryption(format!(
                "unsupported decryption method: {method}"
            )));
        }
        let key: [u8; 16] = key.try_into().map_err(|_| {
            DownloadError::decryption(format!(
                "decryption key has incorrect length: {} bytes (expected 16)",
                key.len()
            ))
        })?;
        Ok(Self { key, iv, method })
    }

    pub fn aes128(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            key,
            iv,
            method: METHOD_AES_128.to_string(),
        }
    }

    /// Parse a hex IV as written in playlists (`0x` prefix optional).
    pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16], DownloadError> {
        let digits = iv_hex
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        let mut iv = [0u8; 16];
        hex::decode_to_slice(digits, &mut iv)
            .map_err(|e| DownloadError::decryption(format!("failed to parse IV '{iv_hex}': {e}")))?;
        Ok(iv)
    }

    /// IV implied by a media sequence number when the playlist omits one.
    pub fn iv_from_sequence(sequence: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&sequence.to_be_bytes());
        iv
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn cipher(&self) -> SegmentCipher {
        SegmentCipher {
            key: self.key,
            chain: self.iv,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
            processed: 0,
        }
    }
}

/// Incremental CBC decryption of one segment.
///
/// `update` emits plaintext for every complete block except the last one,
/// which is held back until `finalize` strips the PKCS#7 padding.
pub struct SegmentCipher {
    key: [u8; 16],
    /// Previous ciphertext block (the IV before the first block)
    chain: [u8; 16],
    pending: Vec<u8>,
    processed: u64,
}

impl SegmentCipher {
    /// Decrypt as much of `data` as possible, appending plaintext to `out`.
    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), DownloadError> {
        self.pending.extend_from_slice(data);

        // Keep at least one full block for finalize.
        let available = self.pending.len().saturating_sub(1) / BLOCK_SIZE * BLOCK_SIZE;
        if available == 0 {
            return Ok(());
        }

        let start = out.len();
        out.extend_from_slice(&self.pending[..available]);
        let next_chain: [u8; 16] = self.pending[available - BLOCK_SIZE..available]
            .try_into()
            .map_err(|_| DownloadError::decryption("cipher chain block out of range"))?;

        Aes128CbcDec::new_from_slices(&self.key, &self.chain)
            .map_err(|e| DownloadError::decryption(format!("failed to initialize AES decryptor: {e}")))?
            .decrypt_padded_mut::<NoPadding>(&mut out[start..])
            .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?;

        self.chain = next_chain;
        self.pending.drain(..available);
        self.processed += available as u64;
        Ok(())
    }

    /// Decrypt the held-back tail and remove the padding.
    pub fn finalize(mut self, out: &mut Vec<u8>) -> Result<(), DownloadError> {
        if self.pending.is_empty() && self.processed == 0 {
            return Ok(());
        }
        if self.pending.len() % BLOCK_SIZE != 0 || self.pending.is_empty() {
            return Err(DownloadError::decryption(format!(
                "ciphertext length {} is not a multiple of the block size",
                self.processed + self.pending.len() as u64
            )));
        }

        let plaintext_len = Aes128CbcDec::new_from_slices(&self.key, &self.chain)
            .map_err(|e| DownloadError::decryption(format!("failed to initialize AES decryptor: {e}")))?
            .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
            .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?
            .len();
        out.extend_from_slice(&self.pending[..plaintext_len]);
        Ok(())
    }

    /// Ciphertext bytes consumed so far, excluding the held-back tail.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

/// Decrypt a whole buffer in one go.
pub fn decrypt_all(key: &DecryptionKey, data: &[u8]) -> Result<Vec<u8>, DownloadError> {
    let mut cipher = key.cipher();
    let mut out = Vec::with_capacity(data.len());
    cipher.update(data, &mut out)?;
    cipher.finalize(&mut out)?;
    Ok(out)
}
