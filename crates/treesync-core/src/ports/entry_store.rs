//! Entry store port (driven/secondary port)
//!
//! This module defines the interface for persisting and querying entries,
//! their adapter bindings, and locally remembered change-tracking cursors.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - There is no delete operation. Removal is expressed by tombstoning the
//!   entry and updating it.
//! - Implementations are not required to support concurrent writers; the
//!   executor serializes all writes.

use crate::domain::{AdapterId, CursorToken, Entry, EntryId, UniqueId};

/// Entry counts reported by [`IEntryStore::count_entries`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EntryCounts {
    pub files: u64,
    pub directories: u64,
    pub deleted: u64,
    pub not_synchronized: u64,
}

impl EntryCounts {
    pub fn total(&self) -> u64 {
        self.files + self.directories
    }
}

/// Port trait for persistent entry storage
#[async_trait::async_trait]
pub trait IEntryStore: Send + Sync {
    /// Retrieves an entry by id
    async fn get_entry(&self, id: EntryId) -> anyhow::Result<Option<Entry>>;

    /// Retrieves the root entry (the one without a parent)
    async fn get_root(&self) -> anyhow::Result<Option<Entry>>;

    /// Retrieves all children of `parent`, tombstoned ones included
    async fn get_children(&self, parent: EntryId) -> anyhow::Result<Vec<Entry>>;

    /// Retrieves the entry bound to `unique_id` on `adapter`
    async fn get_by_binding(
        &self,
        adapter: &AdapterId,
        unique_id: &UniqueId,
    ) -> anyhow::Result<Option<Entry>>;

    /// Retrieves every entry
    async fn get_all(&self) -> anyhow::Result<Vec<Entry>>;

    /// Inserts a new entry together with its bindings
    async fn insert_entry(&self, entry: &Entry) -> anyhow::Result<()>;

    /// Updates an existing entry and replaces its bindings
    async fn update_entry(&self, entry: &Entry) -> anyhow::Result<()>;

    /// Last cursor token committed for `adapter`
    async fn get_cursor(&self, adapter: &AdapterId) -> anyhow::Result<Option<CursorToken>>;

    /// Remember the cursor token committed for `adapter`
    async fn set_cursor(&self, adapter: &AdapterId, token: &CursorToken) -> anyhow::Result<()>;

    /// Entry counts by kind and state
    async fn count_entries(&self) -> anyhow::Result<EntryCounts>;
}
