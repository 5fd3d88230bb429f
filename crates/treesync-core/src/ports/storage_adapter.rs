//! Storage adapter port (driven/secondary port)
//!
//! This module defines the uniform capability surface every storage backend
//! exposes to the engine: item enumeration, content streams, item mutations,
//! and the optional change-tracking and change-notification capabilities.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific
//!   and don't need domain-level classification.
//! - Items are addressed with [`ItemRef`], which carries both the adapter's
//!   unique id (when known) and the relative path. Id-based backends use the
//!   former, path-based backends the latter.
//! - Content writes go through a [`WriteHandle`] so that backends can stage the
//!   bytes and publish the item atomically on [`WriteHandle::commit`].

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::domain::{AdapterId, ChangeTrackingCursor, CursorToken, ItemRef, RawItem};

/// Readable content stream of one file
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Backend family of an adapter, for display and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Filesystem,
    Memory,
    Cloud,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Filesystem => "filesystem",
            Self::Memory => "memory",
            Self::Cloud => "cloud",
        };
        write!(f, "{name}")
    }
}

/// Metadata changes applied by [`IStorageAdapter::update_metadata`]
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    /// Move under this parent
    pub new_parent: Option<ItemRef>,
    /// Rename to this name
    pub new_name: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl MetadataUpdate {
    /// Update that only sets timestamps
    pub fn timestamps(created: Option<DateTime<Utc>>, modified: DateTime<Utc>) -> Self {
        Self {
            created,
            modified: Some(modified),
            ..Self::default()
        }
    }

    pub fn is_relocation(&self) -> bool {
        self.new_parent.is_some() || self.new_name.is_some()
    }
}

/// Result of asking an adapter for changes since a cursor
#[derive(Debug, Clone)]
pub enum ChangeSet {
    /// The delta since the given token
    Delta(ChangeTrackingCursor),
    /// The token is no longer valid; restart from `redirect` when present
    ResyncRequired { redirect: Option<CursorToken> },
}

/// Staged content write, published by [`WriteHandle::commit`]
#[async_trait::async_trait]
pub trait WriteHandle: AsyncWrite + Send + Unpin {
    /// Publish the written bytes as the item and return its metadata
    async fn commit(self: Box<Self>) -> anyhow::Result<RawItem>;

    /// Discard the staged bytes
    async fn abort(self: Box<Self>) -> anyhow::Result<()>;
}

/// Port trait for one storage backend
///
/// ## Implementation Notes
///
/// - `delete_item` on a missing item succeeds; deletions are replayed in
///   child-before-parent order and a removed parent may already have taken
///   its children with it.
/// - `create_directory` on an existing directory of the same name returns it.
/// - `open_write` replaces an existing file of the same name on commit.
#[async_trait::async_trait]
pub trait IStorageAdapter: Send + Sync {
    /// Configured identifier of this adapter
    fn id(&self) -> &AdapterId;

    /// Backend family
    fn kind(&self) -> AdapterKind;

    /// Metadata of the synchronized root
    async fn root(&self) -> anyhow::Result<RawItem>;

    /// Live children of `item`
    async fn list_children(&self, item: &ItemRef) -> anyhow::Result<Vec<RawItem>>;

    /// Current metadata of one item, `None` if it no longer exists
    async fn get_item(&self, item: &ItemRef) -> anyhow::Result<Option<RawItem>>;

    /// Child of `parent` named `name`, if any
    async fn find_child(&self, parent: &ItemRef, name: &str) -> anyhow::Result<Option<RawItem>> {
        let children = self.list_children(parent).await?;
        Ok(children.into_iter().find(|c| c.name == name))
    }

    /// Open the content of a file for reading
    async fn open_read(&self, item: &ItemRef) -> anyhow::Result<ReadStream>;

    /// Start writing a file named `name` under `parent`
    async fn open_write(
        &self,
        parent: &ItemRef,
        name: &str,
        expected_len: u64,
    ) -> anyhow::Result<Box<dyn WriteHandle>>;

    /// Create a directory named `name` under `parent`
    async fn create_directory(&self, parent: &ItemRef, name: &str) -> anyhow::Result<RawItem>;

    /// Delete an item (recursively for directories)
    async fn delete_item(&self, item: &ItemRef) -> anyhow::Result<()>;

    /// Rename, move and/or set timestamps of an item
    async fn update_metadata(
        &self,
        item: &ItemRef,
        update: &MetadataUpdate,
    ) -> anyhow::Result<RawItem>;

    /// Whether [`Self::get_changes`] is available
    fn supports_change_tracking(&self) -> bool {
        false
    }

    /// Changes since `token`; `None` asks for a full initial delta
    async fn get_changes(&self, token: Option<&CursorToken>) -> anyhow::Result<ChangeSet> {
        let _ = token;
        anyhow::bail!("adapter {} does not support change tracking", self.id())
    }

    /// Acknowledge that every change up to `token` has been processed
    async fn commit_cursor(&self, token: &CursorToken) -> anyhow::Result<()> {
        let _ = token;
        Ok(())
    }

    /// Receiver signalled whenever something changes on the backend, if the
    /// adapter supports change notification
    async fn subscribe_changes(&self) -> anyhow::Result<Option<mpsc::Receiver<()>>> {
        Ok(None)
    }
}
