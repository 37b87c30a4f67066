//! # simtree-core
//!
//! The history store for Simtree - THE LOGIC.
//!
//! This crate records simulation trajectories as an append-only tree of
//! immutable states, with runs that can be branched from any recorded
//! state without copying history.
//!
//! ## Components
//!
//! - `nodes`: the state forest (`StateStore`)
//! - `sequence`: ordered run membership (`SequenceIndex`)
//! - `registry`: run records and lifecycle (`RunRegistry`)
//! - `catalog`: simulation templates (`SimulationCatalog`)
//! - `branch`: copy-on-branch forking (`BranchEngine`)
//! - `lineage`: ancestry, descendants, run trees (`Lineage`)
//! - `config`: effective configuration through run ancestry
//! - `history`: facade over all of the above (`History`)
//!
//! ## Architectural Constraints
//!
//! - Every operation is one transaction against a [`Repository`]; a failed
//!   operation leaves no trace.
//! - States are never updated or deleted through the public API.
//! - Has NO async, NO network dependencies.

// =============================================================================
// MODULES
// =============================================================================

pub mod branch;
pub mod catalog;
pub mod config;
pub mod formats;
pub mod history;
pub mod lineage;
pub mod nodes;
pub mod primitives;
pub mod registry;
pub mod repository;
pub mod sequence;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    ConfigMap, EntryId, ErrorKind, NewRun, NewSimulation, NewState, Payload, Run, RunFilter,
    RunId, RunStatus, SimtreeError, Simulation, SimulationId, StateId, StateNode,
    TrajectoryEntry,
};

// =============================================================================
// RE-EXPORTS: Store Components
// =============================================================================

pub use branch::{BranchEngine, BranchRequest};
pub use catalog::SimulationCatalog;
pub use config::ConfigResolver;
pub use history::{History, IntegrityReport, StoreStats};
pub use lineage::{Descendants, Lineage, RunComparison, RunNode, TerminalStates};
pub use nodes::StateStore;
pub use registry::RunRegistry;
pub use repository::{IdKind, ReadTxn, Repository, WriteTxn};
pub use sequence::{SequenceIndex, Trajectory};
pub use storage::{MemoryStore, RedbStore, StorageBackend};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{NextIds, Snapshot, SnapshotHeader};
