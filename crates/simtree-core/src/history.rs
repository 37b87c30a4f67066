//! # History Facade
//!
//! [`History`] bundles a repository with every store operation behind one
//! handle. It is `Sync` whenever the repository is, so a single instance
//! can serve many threads; each call is its own transaction.
//!
//! ## Storage Backends
//!
//! - `History::in_memory()`: volatile [`MemoryStore`]
//! - `History::open(path)`: redb-backed [`RedbStore`] via [`StorageBackend`]
//!
//! [`MemoryStore`]: crate::storage::MemoryStore
//! [`RedbStore`]: crate::storage::RedbStore

use crate::branch::{BranchEngine, BranchRequest};
use crate::catalog::SimulationCatalog;
use crate::config::ConfigResolver;
use crate::formats::Snapshot;
use crate::lineage::{Descendants, Lineage, RunComparison, RunNode, TerminalStates};
use crate::nodes::StateStore;
use crate::registry::RunRegistry;
use crate::repository::Repository;
use crate::sequence::{SequenceIndex, Trajectory};
use crate::storage::StorageBackend;
use crate::types::{
    ConfigMap, NewRun, NewSimulation, NewState, Payload, Run, RunFilter, RunId, RunStatus,
    SimtreeError, Simulation, SimulationId, StateId, StateNode, TrajectoryEntry,
};
use serde::Serialize;
use std::path::Path;

/// Counts for a quick overview of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub simulations: usize,
    pub states: u64,
    pub runs: usize,
    pub active_runs: usize,
    pub branches: usize,
}

/// Result of a structural integrity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub states_checked: u64,
    pub orphans: Vec<StateId>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Versioned, branchable history of simulation runs.
#[derive(Debug)]
pub struct History<R = StorageBackend> {
    repo: R,
}

impl History<StorageBackend> {
    /// Volatile history, lost when dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(StorageBackend::in_memory())
    }

    /// Open or create a redb-backed history at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SimtreeError> {
        StorageBackend::open(path).map(Self::new)
    }

    /// Compact the backing database file, if there is one.
    pub fn compact(&mut self) -> Result<bool, SimtreeError> {
        self.repo.compact()
    }
}

impl<R: Repository> History<R> {
    pub const fn new(repo: R) -> Self {
        Self { repo }
    }

    pub const fn repository(&self) -> &R {
        &self.repo
    }

    // =========================================================================
    // SIMULATIONS
    // =========================================================================

    pub fn create_simulation(&self, new: NewSimulation) -> Result<Simulation, SimtreeError> {
        SimulationCatalog::create(&self.repo, new)
    }

    pub fn get_simulation(&self, id: SimulationId) -> Result<Simulation, SimtreeError> {
        SimulationCatalog::get(&self.repo, id)
    }

    pub fn list_simulations(&self) -> Result<Vec<Simulation>, SimtreeError> {
        SimulationCatalog::list(&self.repo)
    }

    // =========================================================================
    // STATES
    // =========================================================================

    pub fn create_state(&self, new: NewState) -> Result<StateNode, SimtreeError> {
        StateStore::create(&self.repo, new)
    }

    pub fn get_state(&self, id: StateId) -> Result<StateNode, SimtreeError> {
        StateStore::get(&self.repo, id)
    }

    /// Create a state and append it to `run_id` in one transaction.
    ///
    /// Returns the new state and its sequence order. If the append fails
    /// the state is not created either.
    pub fn record_state(
        &self,
        run_id: RunId,
        new: NewState,
    ) -> Result<(StateNode, u64), SimtreeError> {
        let (node, order) = self.repo.write(|txn| {
            let node = StateStore::create_in(txn, new)?;
            let order = SequenceIndex::append_in(txn, run_id, node.id)?;
            Ok((node, order))
        })?;
        tracing::info!(run_id = %run_id, state_id = %node.id, order, "state recorded");
        Ok((node, order))
    }

    // =========================================================================
    // RUNS
    // =========================================================================

    pub fn create_run(&self, new: NewRun) -> Result<Run, SimtreeError> {
        RunRegistry::create_origin(&self.repo, new)
    }

    pub fn get_run(&self, id: RunId) -> Result<Run, SimtreeError> {
        RunRegistry::get(&self.repo, id)
    }

    pub fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, SimtreeError> {
        RunRegistry::list(&self.repo, filter)
    }

    pub fn append_state(&self, run_id: RunId, state_id: StateId) -> Result<u64, SimtreeError> {
        SequenceIndex::append(&self.repo, run_id, state_id)
    }

    pub fn branch(&self, request: BranchRequest) -> Result<Run, SimtreeError> {
        BranchEngine::branch(&self.repo, request)
    }

    pub fn transition_run(&self, id: RunId, to: RunStatus) -> Result<Run, SimtreeError> {
        RunRegistry::transition(&self.repo, id, to)
    }

    pub fn complete_run(
        &self,
        id: RunId,
        total_reward: Option<Payload>,
    ) -> Result<Run, SimtreeError> {
        RunRegistry::complete(&self.repo, id, total_reward)
    }

    /// Full trajectory of a run, in order.
    pub fn get_trajectory(&self, id: RunId) -> Result<Vec<StateNode>, SimtreeError> {
        SequenceIndex::sequence_for(&self.repo, id)?.collect()
    }

    /// Lazy trajectory of a run.
    pub fn stream_trajectory(&self, id: RunId) -> Result<Trajectory<'_, R>, SimtreeError> {
        SequenceIndex::sequence_for(&self.repo, id)
    }

    pub fn trajectory_entries(&self, id: RunId) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
        SequenceIndex::entries(&self.repo, id)
    }

    pub fn position_of(&self, run_id: RunId, state_id: StateId) -> Result<Option<u64>, SimtreeError> {
        SequenceIndex::position_of(&self.repo, run_id, state_id)
    }

    // =========================================================================
    // LINEAGE
    // =========================================================================

    pub fn get_lineage(&self, id: StateId) -> Result<Vec<StateNode>, SimtreeError> {
        Lineage::path_to_root(&self.repo, id)
    }

    pub fn depth(&self, id: StateId) -> Result<u64, SimtreeError> {
        Lineage::depth(&self.repo, id)
    }

    pub fn get_children(&self, id: StateId) -> Result<Vec<StateNode>, SimtreeError> {
        Lineage::children(&self.repo, id)
    }

    pub fn descendants(&self, id: StateId) -> Result<Descendants<'_, R>, SimtreeError> {
        Lineage::descendants(&self.repo, id)
    }

    /// Terminal states accepted by `predicate`.
    pub fn terminal_states_where<F>(&self, predicate: F) -> TerminalStates<'_, R, F>
    where
        F: FnMut(&StateNode) -> bool,
    {
        Lineage::terminal_states(&self.repo, predicate)
    }

    /// Terminal states, optionally only those with `reward >= min_reward`.
    pub fn terminal_states(&self, min_reward: Option<f64>) -> Result<Vec<StateNode>, SimtreeError> {
        self.terminal_states_where(|node| match min_reward {
            Some(min) => node.reward.is_some_and(|r| r >= min),
            None => true,
        })
        .collect()
    }

    pub fn get_run_tree(&self, simulation: SimulationId) -> Result<Vec<RunNode>, SimtreeError> {
        Lineage::run_tree(&self.repo, simulation)
    }

    pub fn compare_runs(&self, left: RunId, right: RunId) -> Result<RunComparison, SimtreeError> {
        Lineage::compare_runs(&self.repo, left, right)
    }

    pub fn runs_containing(&self, state: StateId) -> Result<Vec<Run>, SimtreeError> {
        Lineage::runs_containing(&self.repo, state)
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    pub fn effective_config(&self, run_id: RunId) -> Result<ConfigMap, SimtreeError> {
        ConfigResolver::effective_config(&self.repo, run_id)
    }

    pub fn inheritance_chain(&self, run_id: RunId) -> Result<Vec<Run>, SimtreeError> {
        ConfigResolver::inheritance_chain(&self.repo, run_id)
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    pub fn stats(&self) -> Result<StoreStats, SimtreeError> {
        self.repo.read(|txn| {
            let runs = txn.runs()?;
            Ok(StoreStats {
                simulations: txn.simulations()?.len(),
                states: txn.state_count()?,
                active_runs: runs.iter().filter(|r| r.status == RunStatus::Active).count(),
                branches: runs.iter().filter(|r| r.is_branch()).count(),
                runs: runs.len(),
            })
        })
    }

    /// Check the state forest for cycles and dangling parents.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` if any parent chain loops. Orphans are
    /// reported, not treated as errors.
    pub fn verify(&self) -> Result<IntegrityReport, SimtreeError> {
        StateStore::verify_acyclic(&self.repo)?;
        let orphans = StateStore::orphans(&self.repo)?
            .into_iter()
            .map(|node| node.id)
            .collect();
        Ok(IntegrityReport {
            states_checked: StateStore::count(&self.repo)?,
            orphans,
        })
    }

    pub fn snapshot(&self) -> Result<Snapshot, SimtreeError> {
        Snapshot::capture(&self.repo)
    }

    /// Load a snapshot into this (empty) history.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), SimtreeError> {
        snapshot.restore_into(&self.repo)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn record_state_is_atomic() {
        let history = History::in_memory();
        let sim = history
            .create_simulation(NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = history.create_state(NewState::root("r")).expect("root");
        let run = history
            .create_run(NewRun::new(sim.id, "main", root.id))
            .expect("run");
        history.transition_run(run.id, RunStatus::Paused).expect("pause");

        let before = history.stats().expect("stats");
        let err = history
            .record_state(run.id, NewState::child(root.id, 1, "s1"))
            .expect_err("paused");
        assert!(matches!(err, SimtreeError::RunNotActive { .. }));
        assert_eq!(history.stats().expect("stats"), before);

        history.transition_run(run.id, RunStatus::Active).expect("resume");
        let (node, order) = history
            .record_state(run.id, NewState::child(root.id, 1, "s1"))
            .expect("record");
        assert_eq!(order, 1);
        assert_eq!(history.get_run(run.id).expect("run").current_state_id, node.id);
    }

    #[test]
    fn terminal_states_min_reward() {
        let history = History::in_memory();
        let root = history.create_state(NewState::root("r")).expect("root");
        history
            .create_state(NewState::child(root.id, 1, "a").with_reward(5.0).done())
            .expect("a");
        history
            .create_state(NewState::child(root.id, 1, "b").with_reward(1.0).done())
            .expect("b");
        history
            .create_state(NewState::child(root.id, 1, "c").done())
            .expect("c");

        assert_eq!(history.terminal_states(None).expect("all").len(), 3);
        assert_eq!(history.terminal_states(Some(2.0)).expect("min").len(), 1);
    }

    #[test]
    fn stats_and_verify() {
        let history = History::in_memory();
        let sim = history
            .create_simulation(NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = history.create_state(NewState::root("r")).expect("root");
        let run = history
            .create_run(NewRun::new(sim.id, "main", root.id))
            .expect("run");
        history
            .branch(BranchRequest::new(run.id, root.id, "alt"))
            .expect("branch");

        let stats = history.stats().expect("stats");
        assert_eq!(stats.simulations, 1);
        assert_eq!(stats.states, 1);
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.active_runs, 2);
        assert_eq!(stats.branches, 1);

        let report = history.verify().expect("verify");
        assert!(report.is_clean());
        assert_eq!(report.states_checked, 1);
    }

    #[test]
    fn in_memory_compact_is_noop() {
        let mut history = History::in_memory();
        history.create_state(NewState::root("r")).expect("root");
        assert!(!history.compact().expect("compact"));
        assert_eq!(history.stats().expect("stats").states, 1);
    }
}
