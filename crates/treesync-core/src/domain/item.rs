//! Adapter-reported items
//!
//! [`RawItem`] is what a backend reports about one of its items during
//! enumeration or change tracking. [`ItemRef`] is how the engine addresses an
//! item when calling back into an adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{ContentHashes, EntryKind};
use super::newtypes::{RelativePath, UniqueId};

/// Metadata of one backend item as reported by its adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub unique_id: UniqueId,
    /// Unique id of the containing item, `None` for the adapter root
    pub parent_id: Option<UniqueId>,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Digests the adapter can report cheaply, possibly none
    pub hashes: ContentHashes,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    /// Set when the adapter could not read the item; such items are skipped
    pub error: Option<String>,
}

impl RawItem {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Address of an item on one adapter
///
/// Id-based backends use `unique_id`; path-based backends use `path`.
/// Adapters must accept either being sufficient where they can.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub unique_id: Option<UniqueId>,
    pub path: RelativePath,
}

impl ItemRef {
    #[must_use]
    pub fn new(unique_id: Option<UniqueId>, path: RelativePath) -> Self {
        Self { unique_id, path }
    }

    /// Reference to the adapter root
    #[must_use]
    pub fn root(unique_id: Option<UniqueId>) -> Self {
        Self {
            unique_id,
            path: RelativePath::root(),
        }
    }

    /// Reference built from a reported item located at `path`
    #[must_use]
    pub fn of(item: &RawItem, path: RelativePath) -> Self {
        Self {
            unique_id: Some(item.unique_id.clone()),
            path,
        }
    }
}
