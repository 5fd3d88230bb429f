//! Entry domain entity
//!
//! An [`Entry`] is the persisted, backend-independent record of one file or
//! folder in the synchronized tree. Each backend that knows the item holds an
//! [`AdapterBinding`] mapping the entry to the backend's opaque unique id.
//!
//! ## Lifecycle
//!
//! ```text
//!   analyzer creates        executor inserts        analyzer tombstones
//!   (NotSynchronized) ────► (synchronized) ───────► (IsDeleted)
//!                                 ▲                       │
//!                                 └────── restored ───────┘
//! ```
//!
//! Entries are never physically removed. A tombstoned entry keeps its row and
//! bindings so that a later restore can be recognized by unique id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{validate_name, AdapterId, EntryId, Md5Hash, Sha1Hash, UniqueId};

// ============================================================================
// EntryKind
// ============================================================================

/// Whether an entry is a file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Returns the kind name as a string slice
    pub fn name(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    /// Parse the name produced by [`EntryKind::name`]
    ///
    /// # Errors
    /// Returns error for unknown names
    pub fn from_name(name: &str) -> Result<Self, DomainError> {
        match name {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            other => Err(DomainError::InvalidId(format!("unknown entry kind: {other}"))),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// EntryState bitset
// ============================================================================

/// Persisted state bits of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryState(u8);

impl EntryState {
    /// The entry has changes that were not yet applied to the other side
    pub const NOT_SYNCHRONIZED: u8 = 0b01;
    /// The entry is tombstoned
    pub const IS_DELETED: u8 = 0b10;

    /// Build from raw persisted bits, ignoring unknown bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::NOT_SYNCHRONIZED | Self::IS_DELETED))
    }

    /// Raw bits for persistence
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_not_synchronized(&self) -> bool {
        self.0 & Self::NOT_SYNCHRONIZED != 0
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.0 & Self::IS_DELETED != 0
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

// ============================================================================
// ContentHashes
// ============================================================================

/// SHA-1 and MD5 digests of one side's content, either may be unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes {
    pub sha1: Option<Sha1Hash>,
    pub md5: Option<Md5Hash>,
}

impl ContentHashes {
    /// Hashes with both digests known
    #[must_use]
    pub fn new(sha1: Sha1Hash, md5: Md5Hash) -> Self {
        Self {
            sha1: Some(sha1),
            md5: Some(md5),
        }
    }

    /// Whether no digest is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sha1.is_none() && self.md5.is_none()
    }

    /// True when at least one digest is known on both sides and every digest
    /// known on both sides agrees
    #[must_use]
    pub fn agrees_with(&self, other: &ContentHashes) -> bool {
        let mut compared = false;
        if let (Some(a), Some(b)) = (&self.sha1, &other.sha1) {
            if a != b {
                return false;
            }
            compared = true;
        }
        if let (Some(a), Some(b)) = (&self.md5, &other.md5) {
            if a != b {
                return false;
            }
            compared = true;
        }
        compared
    }
}

// ============================================================================
// AdapterBinding
// ============================================================================

/// Maps an entry to one adapter's opaque unique id for the same item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterBinding {
    pub adapter_id: AdapterId,
    pub unique_id: UniqueId,
}

impl AdapterBinding {
    #[must_use]
    pub fn new(adapter_id: AdapterId, unique_id: UniqueId) -> Self {
        Self {
            adapter_id,
            unique_id,
        }
    }
}

// ============================================================================
// Entry
// ============================================================================

/// Persisted logical file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: EntryId,
    parent_id: Option<EntryId>,
    name: String,
    kind: EntryKind,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    size: u64,
    source_hashes: ContentHashes,
    destination_hashes: ContentHashes,
    state: EntryState,
    bindings: Vec<AdapterBinding>,
}

/// All persisted fields of an entry, used to rebuild one from storage
#[derive(Debug, Clone)]
pub struct EntryParts {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    pub name: String,
    pub kind: EntryKind,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
    pub source_hashes: ContentHashes,
    pub destination_hashes: ContentHashes,
    pub state: EntryState,
    pub bindings: Vec<AdapterBinding>,
}

impl Entry {
    /// Create the root entry of a synchronized tree
    #[must_use]
    pub fn root() -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            parent_id: None,
            name: String::new(),
            kind: EntryKind::Directory,
            created: now,
            modified: now,
            size: 0,
            source_hashes: ContentHashes::default(),
            destination_hashes: ContentHashes::default(),
            state: EntryState::default(),
            bindings: Vec::new(),
        }
    }

    /// Create a new, not yet synchronized entry under `parent_id`
    ///
    /// # Errors
    /// Returns error if `name` is not a valid item name
    pub fn new(
        parent_id: EntryId,
        name: impl Into<String>,
        kind: EntryKind,
        size: u64,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id: EntryId::new(),
            parent_id: Some(parent_id),
            name,
            kind,
            created,
            modified,
            size: if kind == EntryKind::Directory { 0 } else { size },
            source_hashes: ContentHashes::default(),
            destination_hashes: ContentHashes::default(),
            state: EntryState::from_bits(EntryState::NOT_SYNCHRONIZED),
            bindings: Vec::new(),
        })
    }

    /// Rebuild an entry from persisted fields
    ///
    /// # Errors
    /// Returns error if two bindings name the same adapter
    pub fn from_parts(parts: EntryParts) -> Result<Self, DomainError> {
        let mut entry = Self {
            id: parts.id,
            parent_id: parts.parent_id,
            name: parts.name,
            kind: parts.kind,
            created: parts.created,
            modified: parts.modified,
            size: parts.size,
            source_hashes: parts.source_hashes,
            destination_hashes: parts.destination_hashes,
            state: parts.state,
            bindings: Vec::with_capacity(parts.bindings.len()),
        };
        for binding in parts.bindings {
            entry.add_binding(binding)?;
        }
        Ok(entry)
    }

    // --- Getters ---

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn parent_id(&self) -> Option<EntryId> {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn source_hashes(&self) -> &ContentHashes {
        &self.source_hashes
    }

    pub fn destination_hashes(&self) -> &ContentHashes {
        &self.destination_hashes
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    pub fn bindings(&self) -> &[AdapterBinding] {
        &self.bindings
    }

    /// The unique id this entry has on `adapter`, if bound
    pub fn binding_for(&self, adapter: &AdapterId) -> Option<&UniqueId> {
        self.bindings
            .iter()
            .find(|b| &b.adapter_id == adapter)
            .map(|b| &b.unique_id)
    }

    // --- Mutations ---

    /// Add a binding for an adapter the entry is not yet bound to
    ///
    /// # Errors
    /// Returns [`DomainError::DuplicateBinding`] if the adapter already has one
    pub fn add_binding(&mut self, binding: AdapterBinding) -> Result<(), DomainError> {
        if self.binding_for(&binding.adapter_id).is_some() {
            return Err(DomainError::DuplicateBinding {
                entry: self.id.to_string(),
                adapter: binding.adapter_id.to_string(),
            });
        }
        self.bindings.push(binding);
        Ok(())
    }

    /// Bind to `adapter`, replacing an existing binding for it
    pub fn set_binding(&mut self, adapter: AdapterId, unique_id: UniqueId) {
        match self.bindings.iter_mut().find(|b| b.adapter_id == adapter) {
            Some(existing) => existing.unique_id = unique_id,
            None => self.bindings.push(AdapterBinding::new(adapter, unique_id)),
        }
    }

    /// Drop the binding for `adapter`, returning the unique id it held
    pub fn remove_binding(&mut self, adapter: &AdapterId) -> Option<UniqueId> {
        let index = self.bindings.iter().position(|b| &b.adapter_id == adapter)?;
        Some(self.bindings.remove(index).unique_id)
    }

    /// Move under a new parent and/or rename
    ///
    /// # Errors
    /// Returns error if `name` is not a valid item name
    pub fn relocate(&mut self, parent_id: EntryId, name: impl Into<String>) -> Result<(), DomainError> {
        let name = name.into();
        validate_name(&name)?;
        self.parent_id = Some(parent_id);
        self.name = name;
        Ok(())
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_timestamps(&mut self, created: DateTime<Utc>, modified: DateTime<Utc>) {
        self.created = created;
        self.modified = modified;
    }

    pub fn set_modified(&mut self, modified: DateTime<Utc>) {
        self.modified = modified;
    }

    pub fn set_source_hashes(&mut self, hashes: ContentHashes) {
        self.source_hashes = hashes;
    }

    pub fn set_destination_hashes(&mut self, hashes: ContentHashes) {
        self.destination_hashes = hashes;
    }

    /// Flag pending changes
    pub fn mark_not_synchronized(&mut self) {
        self.state.set(EntryState::NOT_SYNCHRONIZED, true);
    }

    /// Clear the pending-changes bit after a successful apply
    pub fn mark_synchronized(&mut self) {
        self.state.set(EntryState::NOT_SYNCHRONIZED, false);
    }

    /// Tombstone the entry
    ///
    /// # Errors
    /// Returns error when called on the root entry
    pub fn tombstone(&mut self) -> Result<(), DomainError> {
        if self.is_root() {
            return Err(DomainError::InvalidState {
                from: "root".to_string(),
                to: "deleted".to_string(),
            });
        }
        self.state.set(EntryState::IS_DELETED, true);
        self.state.set(EntryState::NOT_SYNCHRONIZED, true);
        Ok(())
    }

    /// Clear the tombstone
    pub fn restore(&mut self) {
        self.state.set(EntryState::IS_DELETED, false);
        self.state.set(EntryState::NOT_SYNCHRONIZED, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(name: &str) -> AdapterId {
        AdapterId::new(name.to_string()).unwrap()
    }

    fn uid(value: &str) -> UniqueId {
        UniqueId::new(value.to_string()).unwrap()
    }

    fn file(parent: EntryId, name: &str) -> Entry {
        let now = Utc::now();
        Entry::new(parent, name, EntryKind::File, 500, now, now).unwrap()
    }

    #[test]
    fn test_new_entry_is_not_synchronized() {
        let root = Entry::root();
        let entry = file(root.id(), "readme.txt");
        assert!(entry.state().is_not_synchronized());
        assert!(!entry.is_deleted());
        assert_eq!(entry.parent_id(), Some(root.id()));
        assert_eq!(entry.size(), 500);
    }

    #[test]
    fn test_directory_size_is_zero() {
        let now = Utc::now();
        let dir = Entry::new(EntryId::new(), "docs", EntryKind::Directory, 4096, now, now).unwrap();
        assert_eq!(dir.size(), 0);
        assert!(dir.is_directory());
    }

    #[test]
    fn test_new_rejects_invalid_name() {
        let now = Utc::now();
        assert!(Entry::new(EntryId::new(), "a/b", EntryKind::File, 0, now, now).is_err());
        assert!(Entry::new(EntryId::new(), "..", EntryKind::File, 0, now, now).is_err());
    }

    #[test]
    fn test_one_binding_per_adapter() {
        let mut entry = file(EntryId::new(), "a.txt");
        entry
            .add_binding(AdapterBinding::new(adapter("local"), uid("1")))
            .unwrap();
        let err = entry
            .add_binding(AdapterBinding::new(adapter("local"), uid("2")))
            .unwrap_err();
        assert!(matches!(err, DomainError::DuplicateBinding { .. }));

        entry.set_binding(adapter("local"), uid("3"));
        entry.set_binding(adapter("cloud"), uid("x"));
        assert_eq!(entry.bindings().len(), 2);
        assert_eq!(entry.binding_for(&adapter("local")), Some(&uid("3")));

        assert_eq!(entry.remove_binding(&adapter("local")), Some(uid("3")));
        assert_eq!(entry.remove_binding(&adapter("local")), None);
        assert_eq!(entry.bindings().len(), 1);
    }

    #[test]
    fn test_from_parts_rejects_duplicate_bindings() {
        let now = Utc::now();
        let parts = EntryParts {
            id: EntryId::new(),
            parent_id: None,
            name: String::new(),
            kind: EntryKind::Directory,
            created: now,
            modified: now,
            size: 0,
            source_hashes: ContentHashes::default(),
            destination_hashes: ContentHashes::default(),
            state: EntryState::default(),
            bindings: vec![
                AdapterBinding::new(adapter("local"), uid("1")),
                AdapterBinding::new(adapter("local"), uid("2")),
            ],
        };
        assert!(Entry::from_parts(parts).is_err());
    }

    #[test]
    fn test_tombstone_and_restore() {
        let mut entry = file(EntryId::new(), "a.txt");
        entry.mark_synchronized();
        entry.tombstone().unwrap();
        assert!(entry.is_deleted());
        assert!(entry.state().is_not_synchronized());

        entry.restore();
        assert!(!entry.is_deleted());
    }

    #[test]
    fn test_root_cannot_be_tombstoned() {
        let mut root = Entry::root();
        assert!(root.tombstone().is_err());
    }

    #[test]
    fn test_state_bits_roundtrip() {
        let state = EntryState::from_bits(EntryState::IS_DELETED | 0b1000_0000);
        assert!(state.is_deleted());
        assert!(!state.is_not_synchronized());
        assert_eq!(state.bits(), EntryState::IS_DELETED);
    }

    #[test]
    fn test_hashes_agree_requires_a_common_digest() {
        let sha = Sha1Hash::from_bytes(&[1; 20]).unwrap();
        let md5 = Md5Hash::from_bytes(&[2; 16]).unwrap();
        let a = ContentHashes {
            sha1: Some(sha.clone()),
            md5: None,
        };
        let b = ContentHashes {
            sha1: None,
            md5: Some(md5.clone()),
        };
        assert!(!a.agrees_with(&b));
        assert!(a.agrees_with(&ContentHashes::new(sha, md5)));
    }

    #[test]
    fn test_hashes_disagree_on_mismatch() {
        let a = ContentHashes {
            sha1: Some(Sha1Hash::from_bytes(&[1; 20]).unwrap()),
            md5: None,
        };
        let b = ContentHashes {
            sha1: Some(Sha1Hash::from_bytes(&[9; 20]).unwrap()),
            md5: None,
        };
        assert!(!a.agrees_with(&b));
    }
}
