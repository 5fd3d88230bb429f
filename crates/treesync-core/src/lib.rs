//! treesync Core - Domain model, ports and configuration
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Entry`, `AdapterBinding`, `ChangeDescriptor`,
//!   `ChangeTrackingCursor`, `AnalysisResult`, `SyncPass`
//! - **Port definitions** - Traits for adapters: `IStorageAdapter`, `IEntryStore`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The domain module contains plain data types and their invariants, with no I/O.
//! Ports define the trait interfaces that backend adapters and the entry store
//! implement. The engine crates depend only on these traits, never on concrete
//! backend types.

pub mod config;
pub mod domain;
pub mod ports;
