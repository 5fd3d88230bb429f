//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures, invalid flag combinations, and path errors.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid relative path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid item name (empty, contains a separator, or a dot segment)
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Invalid hash format (expected lowercase hex of the digest length)
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid adapter identifier
    #[error("Invalid adapter ID: {0}")]
    InvalidAdapterId(String),

    /// Invalid adapter-assigned unique identifier
    #[error("Invalid unique ID: {0}")]
    InvalidUniqueId(String),

    /// Invalid change-tracking cursor token
    #[error("Invalid cursor token: {0}")]
    InvalidCursorToken(String),

    /// Change flag set violates a composition rule
    #[error("Invalid change flags: {0}")]
    InvalidFlags(String),

    /// An entry already carries a binding for this adapter
    #[error("Entry {entry} already bound to adapter {adapter}")]
    DuplicateBinding {
        /// The entry identifier
        entry: String,
        /// The adapter identifier
        adapter: String,
    },

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}
