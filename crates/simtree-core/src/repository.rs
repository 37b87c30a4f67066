//! # Repository Abstraction
//!
//! The transactional seam between the store components and a storage
//! backend. Every component operation runs inside exactly one call to
//! [`Repository::read`] or [`Repository::write`]:
//!
//! - `read` sees one consistent snapshot.
//! - `write` commits when the closure returns `Ok` and discards every
//!   change when it returns `Err`. Writers are serialized by the backend.
//!
//! The transaction traits are record-level: they know how to
//! store and index records, nothing about branching or lineage.

use crate::primitives::FIRST_ID;
use crate::types::{
    Run, RunId, SimtreeError, Simulation, SimulationId, StateId, StateNode, TrajectoryEntry,
};
use std::sync::Arc;

/// Identifier families, each with its own monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdKind {
    State,
    Run,
    Simulation,
    Entry,
}

impl IdKind {
    pub const ALL: [Self; 4] = [Self::State, Self::Run, Self::Simulation, Self::Entry];

    /// Metadata key under which the next free identifier is kept.
    #[must_use]
    pub const fn counter_key(self) -> &'static str {
        match self {
            Self::State => "next_state_id",
            Self::Run => "next_run_id",
            Self::Simulation => "next_simulation_id",
            Self::Entry => "next_entry_id",
        }
    }
}

// =============================================================================
// TRANSACTION TRAITS
// =============================================================================

/// Read access to a consistent snapshot.
pub trait ReadTxn {
    fn state(&self, id: StateId) -> Result<Option<StateNode>, SimtreeError>;

    /// Up to `limit` states with `id >= start`, ascending by id.
    fn states_from(&self, start: StateId, limit: usize) -> Result<Vec<StateNode>, SimtreeError>;

    /// Direct children of `parent`, ordered by `(step_number, id)`.
    fn child_ids(&self, parent: StateId) -> Result<Vec<StateId>, SimtreeError>;

    fn state_count(&self) -> Result<u64, SimtreeError>;

    fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, SimtreeError>;

    /// All simulations, ascending by id.
    fn simulations(&self) -> Result<Vec<Simulation>, SimtreeError>;

    fn run(&self, id: RunId) -> Result<Option<Run>, SimtreeError>;

    /// All runs, ascending by id.
    fn runs(&self) -> Result<Vec<Run>, SimtreeError>;

    fn run_ids_for_simulation(&self, simulation: SimulationId) -> Result<Vec<RunId>, SimtreeError>;

    /// Up to `limit` entries of `run` with `sequence_order >= start`, ascending.
    fn entries_from(
        &self,
        run: RunId,
        start: u64,
        limit: usize,
    ) -> Result<Vec<TrajectoryEntry>, SimtreeError>;

    /// Entry with the highest order in `run`.
    fn last_entry(&self, run: RunId) -> Result<Option<TrajectoryEntry>, SimtreeError>;

    /// Order of `state` within `run`, if it is part of the trajectory.
    fn position_of(&self, run: RunId, state: StateId) -> Result<Option<u64>, SimtreeError>;

    /// Runs whose trajectory includes `state`, ascending by id.
    fn runs_containing(&self, state: StateId) -> Result<Vec<RunId>, SimtreeError>;

    /// Next identifier `allocate_id` would hand out.
    fn peek_next_id(&self, kind: IdKind) -> Result<u64, SimtreeError>;
}

/// Write access inside a single atomic transaction.
///
/// `put_*` methods also maintain the secondary indexes for the record.
pub trait WriteTxn: ReadTxn {
    fn allocate_id(&mut self, kind: IdKind) -> Result<u64, SimtreeError>;

    /// Raise the counter for `kind` to at least `next`.
    fn reserve_ids(&mut self, kind: IdKind, next: u64) -> Result<(), SimtreeError>;

    fn put_state(&mut self, node: &StateNode) -> Result<(), SimtreeError>;

    fn put_simulation(&mut self, simulation: &Simulation) -> Result<(), SimtreeError>;

    fn put_run(&mut self, run: &Run) -> Result<(), SimtreeError>;

    fn put_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), SimtreeError>;
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// A transactional storage backend.
pub trait Repository: Send + Sync {
    /// Run `f` against a consistent read snapshot.
    fn read<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T, SimtreeError>;

    /// Run `f` inside an exclusive write transaction.
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise.
    fn write<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T, SimtreeError>;
}

impl<R: Repository> Repository for Arc<R> {
    fn read<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T, SimtreeError>,
    {
        (**self).read(f)
    }

    fn write<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T, SimtreeError>,
    {
        (**self).write(f)
    }
}

/// Counter value with the default applied.
pub(crate) fn counter_or_first(value: Option<u64>) -> u64 {
    value.unwrap_or(FIRST_ID)
}
