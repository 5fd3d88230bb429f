//! treesync Sync - change analysis and pass execution
//!
//! Provides:
//! - Tree-walk and change-tracking analysis of a source adapter
//! - Ordered, bounded-concurrency application of detected changes
//! - Pass orchestration with cursor commit, retry and cancellation
//! - Local filesystem and in-memory storage adapters
//!
//! ## Modules
//!
//! - [`analyzer`] - [`ChangeAnalyzer`], produces change descriptors
//! - [`executor`] - [`SyncExecutor`], applies descriptors to the opposite adapter
//! - [`engine`] - [`SyncEngine`], runs one pass end to end
//! - [`retry`] - Transient error classification and exponential backoff
//! - [`filesystem`] - Local filesystem adapter (inode ids, atomic writes)
//! - [`memory`] - In-memory adapter with a change journal
//! - [`watcher`] - `notify`-based change notification for local trees

pub mod analyzer;
pub mod engine;
pub mod executor;
pub mod filesystem;
pub mod memory;
pub mod retry;
pub mod watcher;

pub use analyzer::ChangeAnalyzer;
pub use engine::{Direction, EngineSettings, SyncEngine};
pub use executor::{ExecutionReport, SyncExecutor};
pub use filesystem::LocalFileSystemAdapter;
pub use memory::MemoryAdapter;
pub use retry::{is_transient_error, with_retry, RetryPolicy};

use thiserror::Error;
use treesync_core::domain::{DomainError, EntryKind, RelativePath};
use treesync_transfer::TransferError;

/// Errors that can occur during analysis or pass execution
#[derive(Debug, Error)]
pub enum SyncError {
    /// Change-tracking items could not be ordered; a parent never resolved
    #[error("Unresolvable dependency: {skipped} requeues with {queued} items left")]
    DependencyCycle { skipped: usize, queued: usize },

    /// A matched item changed between file and directory
    #[error("Unsupported type change at {path}: {from} -> {to}")]
    TypeTransition {
        path: RelativePath,
        from: EntryKind,
        to: EntryKind,
    },

    /// An adapter call failed
    #[error("Adapter {adapter} failed: {message}")]
    Adapter { adapter: String, message: String },

    /// The entry store failed
    #[error("Entry store failed: {0}")]
    Store(String),

    /// The change-tracking cursor was stale and no usable redirect was given
    #[error("Cursor resync failed: {0}")]
    CursorResync(String),

    /// The pass was cancelled
    #[error("Cancelled")]
    Cancelled,

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub(crate) fn adapter(adapter: impl std::fmt::Display, err: anyhow::Error) -> Self {
        SyncError::Adapter {
            adapter: adapter.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        SyncError::Store(format!("{err:#}"))
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
