//! Change descriptors
//!
//! A [`ChangeDescriptor`] is one detected, not yet applied change to an
//! [`Entry`]. Its [`ChangeFlags`] say what kind of change it is; the flag set is
//! validated on construction so that contradictory combinations (a new
//! directory that is also deleted, for instance) can never reach the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::entry::{ContentHashes, Entry};
use super::errors::DomainError;
use super::newtypes::{AdapterId, RelativePath, UniqueId};

// ============================================================================
// ChangeFlag / ChangeFlags
// ============================================================================

/// One facet of a detected change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeFlag {
    NewFile,
    NewDirectory,
    Deleted,
    Restored,
    Renamed,
    Moved,
    ModifiedTimestamp,
    CreatedTimestamp,
    FileSize,
    Sha1Hash,
    Md5Hash,
    DestinationExists,
    Exception,
}

impl ChangeFlag {
    /// Every flag, in bit order
    pub const ALL: [ChangeFlag; 13] = [
        Self::NewFile,
        Self::NewDirectory,
        Self::Deleted,
        Self::Restored,
        Self::Renamed,
        Self::Moved,
        Self::ModifiedTimestamp,
        Self::CreatedTimestamp,
        Self::FileSize,
        Self::Sha1Hash,
        Self::Md5Hash,
        Self::DestinationExists,
        Self::Exception,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Returns the flag name as a string slice
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewFile => "NewFile",
            Self::NewDirectory => "NewDirectory",
            Self::Deleted => "Deleted",
            Self::Restored => "Restored",
            Self::Renamed => "Renamed",
            Self::Moved => "Moved",
            Self::ModifiedTimestamp => "ModifiedTimestamp",
            Self::CreatedTimestamp => "CreatedTimestamp",
            Self::FileSize => "FileSize",
            Self::Sha1Hash => "Sha1Hash",
            Self::Md5Hash => "Md5Hash",
            Self::DestinationExists => "DestinationExists",
            Self::Exception => "Exception",
        }
    }
}

impl fmt::Display for ChangeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Mutually exclusive flag pairs
const EXCLUSIVE: [(ChangeFlag, ChangeFlag); 5] = [
    (ChangeFlag::NewFile, ChangeFlag::NewDirectory),
    (ChangeFlag::NewDirectory, ChangeFlag::Deleted),
    (ChangeFlag::NewFile, ChangeFlag::Deleted),
    (ChangeFlag::Deleted, ChangeFlag::Restored),
    (ChangeFlag::Deleted, ChangeFlag::Moved),
];

/// Non-empty, validated set of [`ChangeFlag`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<ChangeFlag>", into = "Vec<ChangeFlag>")]
pub struct ChangeFlags(u16);

impl ChangeFlags {
    /// Build a flag set
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidFlags`] for an empty set or a set that
    /// combines mutually exclusive flags
    pub fn new(flags: impl IntoIterator<Item = ChangeFlag>) -> Result<Self, DomainError> {
        let bits = flags.into_iter().fold(0u16, |acc, f| acc | f.bit());
        Self::validate(bits)?;
        Ok(Self(bits))
    }

    /// A set holding exactly one flag
    #[must_use]
    pub fn single(flag: ChangeFlag) -> Self {
        Self(flag.bit())
    }

    /// Return a copy with `flag` added
    ///
    /// # Errors
    /// Returns error if the result violates an exclusivity rule
    pub fn with(self, flag: ChangeFlag) -> Result<Self, DomainError> {
        let bits = self.0 | flag.bit();
        Self::validate(bits)?;
        Ok(Self(bits))
    }

    fn validate(bits: u16) -> Result<(), DomainError> {
        if bits == 0 {
            return Err(DomainError::InvalidFlags("flag set is empty".to_string()));
        }
        for (a, b) in EXCLUSIVE {
            if bits & a.bit() != 0 && bits & b.bit() != 0 {
                return Err(DomainError::InvalidFlags(format!(
                    "{a} and {b} are mutually exclusive"
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, flag: ChangeFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Iterate over the set flags in bit order
    pub fn iter(&self) -> impl Iterator<Item = ChangeFlag> + '_ {
        ChangeFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }

    pub fn is_new(&self) -> bool {
        self.contains(ChangeFlag::NewFile) || self.contains(ChangeFlag::NewDirectory)
    }

    pub fn is_new_directory(&self) -> bool {
        self.contains(ChangeFlag::NewDirectory)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(ChangeFlag::Deleted)
    }

    pub fn is_restored(&self) -> bool {
        self.contains(ChangeFlag::Restored)
    }

    /// Rename or move
    pub fn is_relocation(&self) -> bool {
        self.contains(ChangeFlag::Renamed) || self.contains(ChangeFlag::Moved)
    }

    /// Flags that require the file's bytes to be copied again
    pub fn affects_content(&self) -> bool {
        [
            ChangeFlag::FileSize,
            ChangeFlag::Sha1Hash,
            ChangeFlag::Md5Hash,
            ChangeFlag::ModifiedTimestamp,
        ]
        .into_iter()
        .any(|f| self.contains(f))
    }
}

impl TryFrom<Vec<ChangeFlag>> for ChangeFlags {
    type Error = DomainError;

    fn try_from(flags: Vec<ChangeFlag>) -> Result<Self, Self::Error> {
        Self::new(flags)
    }
}

impl From<ChangeFlags> for Vec<ChangeFlag> {
    fn from(flags: ChangeFlags) -> Self {
        flags.iter().collect()
    }
}

impl fmt::Display for ChangeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|flag| flag.name()).collect();
        write!(f, "{}", names.join("|"))
    }
}

// ============================================================================
// Snapshots of old / new values
// ============================================================================

/// Metadata of one side of an item at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub path: Option<RelativePath>,
    pub size: Option<u64>,
    pub hashes: ContentHashes,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    /// Unique id of the item on that side, when known
    pub unique_id: Option<UniqueId>,
}

impl ItemSnapshot {
    /// Snapshot the persisted metadata of `entry` at `path`
    #[must_use]
    pub fn of_entry(entry: &Entry, path: RelativePath, hashes: ContentHashes) -> Self {
        Self {
            path: Some(path),
            size: Some(entry.size()),
            hashes,
            created: Some(entry.created()),
            modified: Some(entry.modified()),
            unique_id: None,
        }
    }
}

/// Old and new values of one side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeValues {
    pub old: ItemSnapshot,
    pub new: ItemSnapshot,
}

// ============================================================================
// ProcessingState
// ============================================================================

/// Execution state of a descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    NotStarted,
    Succeeded,
    Failed,
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// ChangeDescriptor
// ============================================================================

/// One detected change to an entry, originating at one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    /// The entry as it should look once the change is applied
    pub entry: Entry,
    /// Adapter on which the change was observed
    pub origin: AdapterId,
    pub flags: ChangeFlags,
    /// Values on the source side of the relationship
    pub source: ChangeValues,
    /// Values on the destination side of the relationship
    pub destination: ChangeValues,
    state: ProcessingState,
    error: Option<String>,
}

impl ChangeDescriptor {
    #[must_use]
    pub fn new(entry: Entry, origin: AdapterId, flags: ChangeFlags) -> Self {
        Self {
            entry,
            origin,
            flags,
            source: ChangeValues::default(),
            destination: ChangeValues::default(),
            state: ProcessingState::NotStarted,
            error: None,
        }
    }

    /// Current path of the item: the new path, or the old one for deletions
    pub fn path(&self) -> RelativePath {
        self.source
            .new
            .path
            .clone()
            .or_else(|| self.source.old.path.clone())
            .unwrap_or_default()
    }

    /// Path before the change, when it differs from [`Self::path`]
    pub fn previous_path(&self) -> Option<&RelativePath> {
        self.source.old.path.as_ref()
    }

    pub fn path_new(&self) -> Option<&RelativePath> {
        self.source.new.path.as_ref()
    }

    pub fn size_new(&self) -> Option<u64> {
        self.source.new.size
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Record a successful apply
    pub fn mark_succeeded(&mut self) {
        self.state = ProcessingState::Succeeded;
        self.error = None;
    }

    /// Record a failed apply with its message
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.state = ProcessingState::Failed;
        self.error = Some(message.into());
    }
}
