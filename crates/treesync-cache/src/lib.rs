//! treesync Cache - persistent entry store
//!
//! SQLite-based storage for:
//! - Entries (the logical tree, tombstones included)
//! - Adapter bindings (entry to per-adapter unique id)
//! - Change-tracking cursors remembered per adapter
//!
//! ## Architecture
//!
//! This crate implements the `IEntryStore` port from `treesync-core` using
//! SQLite as the storage backend. It is a driven (secondary) adapter.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteEntryStore`] - Full `IEntryStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use treesync_cache::{DatabasePool, SqliteEntryStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/treesync/entries.db")).await?;
//! let store = SqliteEntryStore::new(pool.pool().clone());
//! // Use store as IEntryStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::SqliteEntryStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be turned back into a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<treesync_core::domain::DomainError> for CacheError {
    fn from(e: treesync_core::domain::DomainError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
