//! # Formats
//!
//! Serialization of whole stores. File I/O lives in the app layer.

pub mod snapshot;

pub use snapshot::{NextIds, Snapshot, SnapshotHeader};
