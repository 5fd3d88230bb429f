//! treesync Transfer - moving one item's bytes between two adapters
//!
//! This crate provides the leaf components of the engine:
//! - [`throttle::ThrottlingManager`] - token-bucket write-rate limiter
//! - [`codec::EncryptionCodec`] - per-file streaming AES-CBC with a
//!   self-describing 1024-byte header
//! - [`pipeline::TransferPipeline`] - chunked copy with SHA-1/MD5 on both the
//!   read and the written stream, optional throttling and encryption
//! - [`throughput::ThroughputMeter`] - rolling-window throughput estimate
//!
//! ## Data flow
//!
//! ```text
//!  ReadStream ──► [digest: read] ──► EncryptionCodec? ──► [digest: written] ──► WriteHandle
//!                                          ▲
//!                           ThrottlingManager gates each chunk
//! ```

pub mod codec;
pub mod digest;
pub mod pipeline;
pub mod throttle;
pub mod throughput;

pub use codec::{
    decrypted_size, encrypted_size, thumbprint, CodecMode, CodecPhase, EncryptedHeader,
    EncryptionCodec, KeySource, PemKeySource, BLOCK_SIZE, HEADER_SIZE,
};
pub use digest::{hash_reader, StreamDigests};
pub use pipeline::{TransferOutcome, TransferPipeline, DEFAULT_CHUNK_SIZE};
pub use throttle::ThrottlingManager;
pub use throughput::ThroughputMeter;

use thiserror::Error;

/// Errors raised while transferring or transforming content
#[derive(Debug, Error)]
pub enum TransferError {
    /// Reading or writing one of the streams failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The encrypted header failed its checksum or structural checks
    #[error("Encrypted header is corrupt: {0}")]
    HeaderIntegrity(String),

    /// No private key matches the header's certificate thumbprint, or unwrap failed
    #[error("Cannot unwrap content key: {0}")]
    KeyUnwrap(String),

    /// Wrapping the content key or generating key material failed
    #[error("Encryption setup failed: {0}")]
    Encryption(String),

    /// Ciphertext could not be decrypted (bad padding or truncated body)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The stream length disagrees with the declared length
    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// The codec was used out of order or after finalization
    #[error("Codec misuse: {0}")]
    InvalidState(String),

    /// The pass was cancelled while the transfer was in flight
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Result type for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
