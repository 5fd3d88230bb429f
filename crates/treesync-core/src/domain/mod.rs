//! Domain entities and business rules
//!
//! This module contains the core domain types for treesync:
//! - Newtypes for type-safe identifiers, hashes and relative paths
//! - Entries and their per-adapter bindings
//! - Adapter-reported items and item references
//! - Change descriptors and their flag sets
//! - Analysis results and change-tracking cursors
//! - Pass outcomes and progress events
//! - Domain-specific error types

pub mod analysis;
pub mod change;
pub mod entry;
pub mod errors;
pub mod item;
pub mod newtypes;
pub mod pass;

// Re-export commonly used types
pub use analysis::{AnalysisResult, AnalysisSummary, ChangeTrackingCursor, RawChange};
pub use change::{
    ChangeDescriptor, ChangeFlag, ChangeFlags, ChangeValues, ItemSnapshot, ProcessingState,
};
pub use entry::{AdapterBinding, ContentHashes, Entry, EntryKind, EntryParts, EntryState};
pub use errors::DomainError;
pub use item::{ItemRef, RawItem};
pub use newtypes::*;
pub use pass::{PassMode, PassOutcome, PassStage, ProgressEvent, SyncPass};
