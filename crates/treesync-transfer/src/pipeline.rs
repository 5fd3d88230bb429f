//! Chunked copy from one stream to another
//!
//! The pipeline reads fixed-size chunks, hashes what it read, optionally
//! passes the chunk through an [`EncryptionCodec`], hashes what it is about to
//! write, then writes. A read shorter than the chunk size marks the last chunk,
//! which is where the codec is finalized.
//!
//! Cancellation is observed once per chunk. Throttling, when configured, gates
//! every chunk before it is read.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use treesync_core::domain::ContentHashes;

use crate::codec::{CodecMode, EncryptionCodec};
use crate::digest::StreamDigests;
use crate::throttle::ThrottlingManager;
use crate::throughput::ThroughputMeter;
use crate::{Result, TransferError};

/// Default chunk size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// What one transfer moved and the digests of both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Digests of the bytes read from the origin
    pub read_digests: ContentHashes,
    /// Digests of the bytes handed to the target
    pub written_digests: ContentHashes,
    pub mode: Option<CodecMode>,
}

impl TransferOutcome {
    /// Digests of the unencrypted content
    pub fn original_digests(&self) -> &ContentHashes {
        match self.mode {
            Some(CodecMode::Decrypt) => &self.written_digests,
            _ => &self.read_digests,
        }
    }

    /// Digests of the encrypted container, if a codec was involved
    pub fn transformed_digests(&self) -> Option<&ContentHashes> {
        match self.mode {
            Some(CodecMode::Encrypt) => Some(&self.written_digests),
            Some(CodecMode::Decrypt) => Some(&self.read_digests),
            None => None,
        }
    }
}

/// Streams content between adapters
#[derive(Debug, Clone)]
pub struct TransferPipeline {
    chunk_size: usize,
    throttle: Option<Arc<ThrottlingManager>>,
    meter: Option<Arc<ThroughputMeter>>,
    cancel: CancellationToken,
}

impl TransferPipeline {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            throttle: None,
            meter: None,
            cancel,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<ThrottlingManager>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    #[must_use]
    pub fn with_meter(mut self, meter: Arc<ThroughputMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `reader` into `writer`, transforming through `codec` when given.
    ///
    /// The writer is flushed but not committed; committing is the caller's
    /// decision once the outcome has been checked.
    ///
    /// # Errors
    /// Returns [`TransferError::Cancelled`] when the pass is cancelled, codec
    /// errors unchanged, and I/O errors from either stream.
    #[instrument(skip_all, fields(chunk_size = self.chunk_size, codec = ?codec.as_ref().map(EncryptionCodec::mode)))]
    pub async fn transfer<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        mut codec: Option<EncryptionCodec>,
    ) -> Result<TransferOutcome>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mode = codec.as_ref().map(EncryptionCodec::mode);
        let mut read_digests = StreamDigests::new();
        let mut written_digests = StreamDigests::new();
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if let Some(throttle) = &self.throttle {
                throttle.acquire(self.chunk_size as u64, &self.cancel).await?;
            }

            let n = fill(reader, &mut buf).await?;
            let last = n < self.chunk_size;
            let chunk = &buf[..n];
            read_digests.update(chunk);

            let transformed;
            let out: &[u8] = match codec.as_mut() {
                Some(codec) if last => {
                    transformed = codec.finalize(chunk)?;
                    &transformed
                }
                Some(codec) => {
                    transformed = codec.transform(chunk)?;
                    &transformed
                }
                None => chunk,
            };

            if !out.is_empty() {
                writer.write_all(out).await?;
                written_digests.update(out);
            }
            if let Some(meter) = &self.meter {
                meter.record(out.len() as u64);
            }
            if last {
                break;
            }
        }
        writer.flush().await?;

        let outcome = TransferOutcome {
            bytes_read: read_digests.bytes(),
            bytes_written: written_digests.bytes(),
            read_digests: read_digests.finalize(),
            written_digests: written_digests.finalize(),
            mode,
        };
        debug!(
            bytes_read = outcome.bytes_read,
            bytes_written = outcome.bytes_written,
            "Transfer complete"
        );
        Ok(outcome)
    }
}

/// Read until `buf` is full or the stream ends
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
