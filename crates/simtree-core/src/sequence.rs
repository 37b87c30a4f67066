//! # Sequence Index
//!
//! Ordered membership of states in runs.
//!
//! A run's trajectory is the list of its [`TrajectoryEntry`]s ordered by
//! `sequence_order`, which is always exactly `0..len`. Appends take
//! `max + 1` inside the write transaction, so concurrent appenders to the
//! same run serialize and never produce duplicate or missing orders.
//!
//! Branching copies a prefix of the parent's entries into the new run, so
//! later appends to either run never affect the other.

use crate::nodes::StateStore;
use crate::primitives::PAGE_SIZE;
use crate::registry::RunRegistry;
use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn};
use crate::types::{
    EntryId, RunId, RunStatus, SimtreeError, StateId, StateNode, TrajectoryEntry,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Operations on run trajectories.
pub struct SequenceIndex;

impl SequenceIndex {
    /// Append `state_id` to the end of `run_id`'s trajectory.
    ///
    /// Returns the assigned `sequence_order`. The run's `current_state_id`,
    /// `total_steps`, and scalar `total_reward` are updated in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` / `StateNotFound` for unknown ids
    /// - `RunNotActive` if the run is paused, completed, or failed
    /// - `DuplicateState` if the state is already part of this run
    pub fn append<R: Repository>(
        repo: &R,
        run_id: RunId,
        state_id: StateId,
    ) -> Result<u64, SimtreeError> {
        let order = repo.write(|txn| Self::append_in(txn, run_id, state_id))?;
        tracing::info!(run_id = %run_id, state_id = %state_id, order, "state appended");
        Ok(order)
    }

    pub(crate) fn append_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        run_id: RunId,
        state_id: StateId,
    ) -> Result<u64, SimtreeError> {
        let state = StateStore::require_in(&*txn, state_id)?;
        let mut run = RunRegistry::require_in(&*txn, run_id)?;
        if run.status != RunStatus::Active {
            return Err(SimtreeError::RunNotActive {
                run: run_id,
                status: run.status,
            });
        }
        if txn.position_of(run_id, state_id)?.is_some() {
            return Err(SimtreeError::DuplicateState {
                run: run_id,
                state: state_id,
            });
        }

        let order = txn
            .last_entry(run_id)?
            .map_or(0, |last| last.sequence_order.saturating_add(1));
        Self::put_entry_in(txn, run_id, state_id, order, Utc::now())?;
        RunRegistry::set_current_state_in(txn, &mut run, &state)?;
        Ok(order)
    }

    pub(crate) fn put_entry_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        run_id: RunId,
        state_id: StateId,
        order: u64,
        now: DateTime<Utc>,
    ) -> Result<TrajectoryEntry, SimtreeError> {
        let entry = TrajectoryEntry {
            id: EntryId(txn.allocate_id(IdKind::Entry)?),
            run_id,
            state_id,
            sequence_order: order,
            created_at: now,
        };
        txn.put_entry(&entry)?;
        Ok(entry)
    }

    /// Copy `source`'s entries with order `<= position_of(up_to)` into
    /// `target`, renumbered from 0 and preserving relative order.
    ///
    /// Returns the copied state ids in order. The prefix includes `up_to`.
    ///
    /// # Errors
    ///
    /// Returns `BranchPointNotInSource` if `up_to` is not in `source`.
    pub(crate) fn copy_prefix_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        source: RunId,
        target: RunId,
        up_to: StateId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateId>, SimtreeError> {
        let end = txn
            .position_of(source, up_to)?
            .ok_or(SimtreeError::BranchPointNotInSource {
                run: source,
                state: up_to,
            })?;

        let mut copied = Vec::new();
        let mut next = 0;
        while next <= end {
            let page = txn.entries_from(source, next, PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            for entry in page.iter().take_while(|e| e.sequence_order <= end) {
                let order = copied.len() as u64;
                Self::put_entry_in(txn, target, entry.state_id, order, now)?;
                copied.push(entry.state_id);
            }
            next = page
                .last()
                .map_or(u64::MAX, |e| e.sequence_order.saturating_add(1));
        }
        Ok(copied)
    }

    /// Lazily iterate the states of `run_id` in sequence order.
    ///
    /// Each page is read in its own transaction; the iterator can be
    /// dropped at any point. Call again to restart.
    pub fn sequence_for<R: Repository>(
        repo: &R,
        run_id: RunId,
    ) -> Result<Trajectory<'_, R>, SimtreeError> {
        repo.read(|txn| RunRegistry::require_in(txn, run_id))?;
        Ok(Trajectory {
            repo,
            run_id,
            next_order: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Entries of `run_id` in sequence order.
    pub fn entries<R: Repository>(
        repo: &R,
        run_id: RunId,
    ) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
        repo.read(|txn| {
            RunRegistry::require_in(txn, run_id)?;
            Self::entries_in(txn, run_id)
        })
    }

    pub(crate) fn entries_in<T: ReadTxn + ?Sized>(
        txn: &T,
        run_id: RunId,
    ) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
        let mut entries: Vec<TrajectoryEntry> = Vec::new();
        loop {
            let start = entries
                .last()
                .map_or(0, |e| e.sequence_order.saturating_add(1));
            let page = txn.entries_from(run_id, start, PAGE_SIZE)?;
            let full = page.len() == PAGE_SIZE;
            entries.extend(page);
            if !full {
                return Ok(entries);
            }
        }
    }

    /// Order of `state_id` in `run_id`, or `None` if it is not part of it.
    pub fn position_of<R: Repository>(
        repo: &R,
        run_id: RunId,
        state_id: StateId,
    ) -> Result<Option<u64>, SimtreeError> {
        repo.read(|txn| {
            RunRegistry::require_in(txn, run_id)?;
            txn.position_of(run_id, state_id)
        })
    }
}

// =============================================================================
// LAZY TRAJECTORY
// =============================================================================

/// Finite, restartable stream over one run's states.
///
/// Yields `Err` at most once, then stops.
pub struct Trajectory<'r, R> {
    repo: &'r R,
    run_id: RunId,
    next_order: u64,
    buffer: VecDeque<StateNode>,
    exhausted: bool,
}

impl<R> std::fmt::Debug for Trajectory<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trajectory")
            .field("run_id", &self.run_id)
            .field("next_order", &self.next_order)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<R: Repository> Trajectory<'_, R> {
    fn fill(&mut self) -> Result<(), SimtreeError> {
        let (run_id, start) = (self.run_id, self.next_order);
        let page = self.repo.read(|txn| {
            txn.entries_from(run_id, start, PAGE_SIZE)?
                .into_iter()
                .map(|entry| StateStore::require_in(txn, entry.state_id))
                .collect::<Result<Vec<_>, _>>()
        })?;
        if page.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        self.next_order = self.next_order.saturating_add(page.len() as u64);
        self.buffer.extend(page);
        Ok(())
    }
}

impl<R: Repository> Iterator for Trajectory<'_, R> {
    type Item = Result<StateNode, SimtreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::catalog::SimulationCatalog;
    use crate::storage::MemoryStore;
    use crate::types::{NewRun, NewSimulation, NewState, Run};

    fn setup(repo: &MemoryStore) -> (Run, StateNode) {
        let sim = SimulationCatalog::create(repo, NewSimulation::new("sim", "grid", "random"))
            .expect("sim");
        let root = StateStore::create(repo, NewState::root("s0")).expect("root");
        let run = RunRegistry::create_origin(repo, NewRun::new(sim.id, "main", root.id))
            .expect("run");
        (run, root)
    }

    #[test]
    fn append_assigns_consecutive_orders() {
        let repo = MemoryStore::new();
        let (run, root) = setup(&repo);
        let s1 = StateStore::create(&repo, NewState::child(root.id, 1, "s1")).expect("s1");
        let s2 = StateStore::create(&repo, NewState::child(s1.id, 2, "s2")).expect("s2");

        assert_eq!(SequenceIndex::append(&repo, run.id, s1.id).expect("a1"), 1);
        assert_eq!(SequenceIndex::append(&repo, run.id, s2.id).expect("a2"), 2);

        let orders: Vec<_> = SequenceIndex::entries(&repo, run.id)
            .expect("entries")
            .iter()
            .map(|e| e.sequence_order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(
            SequenceIndex::position_of(&repo, run.id, s2.id).expect("pos"),
            Some(2)
        );
    }

    #[test]
    fn append_updates_run_counters() {
        let repo = MemoryStore::new();
        let (run, root) = setup(&repo);
        let s1 = StateStore::create(&repo, NewState::child(root.id, 1, "s1").with_reward(1.5))
            .expect("s1");
        SequenceIndex::append(&repo, run.id, s1.id).expect("append");

        let run = RunRegistry::get(&repo, run.id).expect("run");
        assert_eq!(run.current_state_id, s1.id);
        assert_eq!(run.total_steps, 1);
        assert_eq!(run.total_reward.and_then(|r| r.as_f64()), Some(1.5));
    }

    #[test]
    fn duplicate_append_is_rejected_and_changes_nothing() {
        let repo = MemoryStore::new();
        let (run, root) = setup(&repo);
        let err = SequenceIndex::append(&repo, run.id, root.id).expect_err("dup");
        assert!(matches!(err, SimtreeError::DuplicateState { .. }));
        assert_eq!(SequenceIndex::entries(&repo, run.id).expect("entries").len(), 1);
        assert_eq!(RunRegistry::get(&repo, run.id).expect("run").total_steps, 0);
    }

    #[test]
    fn append_to_unknown_run_or_state() {
        let repo = MemoryStore::new();
        let (run, _) = setup(&repo);
        assert!(matches!(
            SequenceIndex::append(&repo, RunId(99), StateId(1)),
            Err(SimtreeError::RunNotFound(RunId(99)))
        ));
        assert!(matches!(
            SequenceIndex::append(&repo, run.id, StateId(99)),
            Err(SimtreeError::StateNotFound(StateId(99)))
        ));
    }

    #[test]
    fn paused_run_rejects_appends() {
        let repo = MemoryStore::new();
        let (run, root) = setup(&repo);
        RunRegistry::transition(&repo, run.id, RunStatus::Paused).expect("pause");
        let s1 = StateStore::create(&repo, NewState::child(root.id, 1, "s1")).expect("s1");
        assert!(matches!(
            SequenceIndex::append(&repo, run.id, s1.id),
            Err(SimtreeError::RunNotActive {
                status: RunStatus::Paused,
                ..
            })
        ));
    }

    #[test]
    fn trajectory_streams_across_pages() {
        let repo = MemoryStore::new();
        let (run, root) = setup(&repo);
        let mut parent = root.id;
        for step in 1..=(PAGE_SIZE as u64 * 2 + 3) {
            let s = StateStore::create(&repo, NewState::child(parent, step, "s")).expect("s");
            SequenceIndex::append(&repo, run.id, s.id).expect("append");
            parent = s.id;
        }

        let steps: Vec<u64> = SequenceIndex::sequence_for(&repo, run.id)
            .expect("stream")
            .map(|s| s.expect("state").step_number)
            .collect();
        assert_eq!(steps.len(), PAGE_SIZE * 2 + 4);
        assert!(steps.windows(2).all(|w| w[0] < w[1]));

        let first_three: Vec<_> = SequenceIndex::sequence_for(&repo, run.id)
            .expect("restart")
            .take(3)
            .map(|s| s.expect("state").step_number)
            .collect();
        assert_eq!(first_three, vec![0, 1, 2]);
    }

    #[test]
    fn sequence_for_unknown_run() {
        let repo = MemoryStore::new();
        assert!(matches!(
            SequenceIndex::sequence_for(&repo, RunId(3)),
            Err(SimtreeError::RunNotFound(RunId(3)))
        ));
    }

    #[test]
    fn copy_prefix_requires_membership() {
        let repo = MemoryStore::new();
        let (run, _) = setup(&repo);
        let stray = StateStore::create(&repo, NewState::root("stray")).expect("stray");
        let err = repo
            .write(|txn| {
                SequenceIndex::copy_prefix_in(txn, run.id, RunId(50), stray.id, Utc::now())
            })
            .expect_err("not in source");
        assert!(matches!(err, SimtreeError::BranchPointNotInSource { .. }));
    }
}
