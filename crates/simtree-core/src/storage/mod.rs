//! # Storage Backends
//!
//! Two [`Repository`] implementations:
//! - [`MemoryStore`]: `BTreeMap` tables behind a lock, undo log for rollback
//! - [`RedbStore`]: redb database file, native ACID transactions
//!
//! [`StorageBackend`] lets callers pick one at runtime.

mod memory;
mod redb_store;
mod tables;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::repository::{ReadTxn, Repository, WriteTxn};
use crate::types::SimtreeError;
use std::path::Path;

/// Runtime choice of storage.
#[derive(Debug)]
pub enum StorageBackend {
    /// Volatile storage, lost when dropped.
    InMemory(MemoryStore),
    /// redb database file.
    Persistent(RedbStore),
}

impl StorageBackend {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::InMemory(MemoryStore::new())
    }

    /// Open or create a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SimtreeError> {
        RedbStore::open(path).map(Self::Persistent)
    }

    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }

    /// Compact the database file. A no-op returning `false` in memory.
    pub fn compact(&mut self) -> Result<bool, SimtreeError> {
        match self {
            Self::InMemory(_) => Ok(false),
            Self::Persistent(store) => store.compact(),
        }
    }
}

impl Repository for StorageBackend {
    fn read<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T, SimtreeError>,
    {
        match self {
            Self::InMemory(store) => store.read(f),
            Self::Persistent(store) => store.read(f),
        }
    }

    fn write<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T, SimtreeError>,
    {
        match self {
            Self::InMemory(store) => store.write(f),
            Self::Persistent(store) => store.write(f),
        }
    }
}
