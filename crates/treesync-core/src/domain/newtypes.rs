//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

/// Identifier of a persisted [`Entry`](super::entry::Entry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new random EntryId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an EntryId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid UUID: {e}")))
    }
}

impl From<Uuid> for EntryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifier of a [`SyncPass`](super::pass::SyncPass)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassId(Uuid);

impl PassId {
    /// Create a new random PassId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Adapter-facing identifiers
// ============================================================================

/// Name of a configured backend adapter, e.g. `"local"` or `"archive"`
///
/// Format: lowercase ASCII letters, digits, `-` and `_`, at most 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdapterId(String);

impl AdapterId {
    const MAX_LEN: usize = 64;

    /// Create a new AdapterId
    ///
    /// # Errors
    /// Returns error if the name is empty, too long, or has invalid characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidAdapterId(
                "Adapter ID cannot be empty".to_string(),
            ));
        }
        if id.len() > Self::MAX_LEN {
            return Err(DomainError::InvalidAdapterId(format!(
                "Adapter ID longer than {} characters: {id}",
                Self::MAX_LEN
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(DomainError::InvalidAdapterId(format!(
                "Adapter ID contains invalid characters: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AdapterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AdapterId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for AdapterId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<AdapterId> for String {
    fn from(id: AdapterId) -> Self {
        id.0
    }
}

/// Adapter-assigned opaque identifier of an item
///
/// Stable across renames and moves on the owning backend, but not across
/// delete and recreate. The engine never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UniqueId(String);

impl UniqueId {
    /// Create a new UniqueId
    ///
    /// # Errors
    /// Returns error if the identifier is empty or contains control characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidUniqueId(
                "Unique ID cannot be empty".to_string(),
            ));
        }
        if id.chars().any(char::is_control) {
            return Err(DomainError::InvalidUniqueId(format!(
                "Unique ID contains control characters: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniqueId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for UniqueId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<UniqueId> for String {
    fn from(id: UniqueId) -> Self {
        id.0
    }
}

/// Opaque change-tracking cursor token issued by an adapter
///
/// The token is opaque - we don't validate its contents, only that it's non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CursorToken(String);

impl CursorToken {
    /// Create a new CursorToken
    ///
    /// # Errors
    /// Returns error if the token is empty
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidCursorToken(
                "Cursor token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CursorToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CursorToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for CursorToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<CursorToken> for String {
    fn from(token: CursorToken) -> Self {
        token.0
    }
}

// ============================================================================
// Paths
// ============================================================================

/// A `/`-separated path relative to the synchronized root
///
/// The root itself is the empty path. Components are never empty, `.` or `..`,
/// and the path never starts or ends with a separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath
    ///
    /// # Errors
    /// Returns error if any component is empty or a dot segment
    pub fn new(path: String) -> Result<Self, DomainError> {
        if path.is_empty() {
            return Ok(Self::root());
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Relative path must not start or end with '/': {path}"
            )));
        }
        for component in path.split('/') {
            validate_name(component)
                .map_err(|_| DomainError::InvalidPath(format!("Invalid component in {path}")))?;
        }
        Ok(Self(path))
    }

    /// The synchronized root (empty path)
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Whether this is the root path
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one component
    ///
    /// # Errors
    /// Returns error if the component is not a valid item name
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        validate_name(name)?;
        if self.is_root() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    /// Get the parent path (`None` for the root)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Get the last component (`None` for the root)
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Iterate over the components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

/// Validate a single item name
///
/// # Errors
/// Returns error for empty names, names containing `/` or NUL, and dot segments
pub fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(DomainError::InvalidName(format!("{name:?}")));
    }
    Ok(())
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// Content hashes
// ============================================================================

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn validate_hex(hash: &str, expected_bytes: usize, kind: &str) -> Result<(), DomainError> {
    if hash.len() != expected_bytes * 2 {
        return Err(DomainError::InvalidHash(format!(
            "{kind} hash has wrong length: expected {} hex chars, got {}",
            expected_bytes * 2,
            hash.len()
        )));
    }
    if !hash
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(DomainError::InvalidHash(format!(
            "{kind} hash is not lowercase hex: {hash}"
        )));
    }
    Ok(())
}

/// SHA-1 content digest in lowercase hex (40 characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha1Hash(String);

impl Sha1Hash {
    const DIGEST_LEN: usize = 20;

    /// Create a new Sha1Hash from its hex form (case-insensitive)
    ///
    /// # Errors
    /// Returns error if the string is not 40 hex characters
    pub fn new(hash: String) -> Result<Self, DomainError> {
        let hash = hash.to_ascii_lowercase();
        validate_hex(&hash, Self::DIGEST_LEN, "SHA-1")?;
        Ok(Self(hash))
    }

    /// Create from raw digest bytes
    ///
    /// # Errors
    /// Returns error if the slice is not 20 bytes long
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != Self::DIGEST_LEN {
            return Err(DomainError::InvalidHash(format!(
                "SHA-1 digest must be {} bytes, got {}",
                Self::DIGEST_LEN,
                bytes.len()
            )));
        }
        Ok(Self(to_hex(bytes)))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Sha1Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Sha1Hash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for Sha1Hash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Sha1Hash> for String {
    fn from(hash: Sha1Hash) -> Self {
        hash.0
    }
}

/// MD5 content digest in lowercase hex (32 characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Md5Hash(String);

impl Md5Hash {
    const DIGEST_LEN: usize = 16;

    /// Create a new Md5Hash from its hex form (case-insensitive)
    ///
    /// # Errors
    /// Returns error if the string is not 32 hex characters
    pub fn new(hash: String) -> Result<Self, DomainError> {
        let hash = hash.to_ascii_lowercase();
        validate_hex(&hash, Self::DIGEST_LEN, "MD5")?;
        Ok(Self(hash))
    }

    /// Create from raw digest bytes
    ///
    /// # Errors
    /// Returns error if the slice is not 16 bytes long
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != Self::DIGEST_LEN {
            return Err(DomainError::InvalidHash(format!(
                "MD5 digest must be {} bytes, got {}",
                Self::DIGEST_LEN,
                bytes.len()
            )));
        }
        Ok(Self(to_hex(bytes)))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Md5Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Md5Hash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for Md5Hash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Md5Hash> for String {
    fn from(hash: Md5Hash) -> Self {
        hash.0
    }
}
