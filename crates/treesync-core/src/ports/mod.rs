//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the engine depends on,
//! but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IStorageAdapter`] - Uniform capability surface of one storage backend
//!   (enumeration, streams, mutations, optional change tracking/notification)
//! - [`IEntryStore`] - Persistent store of entries, bindings and cursors

pub mod entry_store;
pub mod storage_adapter;

pub use entry_store::{EntryCounts, IEntryStore};
pub use storage_adapter::{
    AdapterKind, ChangeSet, IStorageAdapter, MetadataUpdate, ReadStream, WriteHandle,
};
