//! # In-Memory Storage
//!
//! `BTreeMap`-backed repository for tests and ephemeral use.
//!
//! A write transaction holds the write lock for its whole duration, so
//! writers are serialized and readers never see a partial write. Every
//! mutation records an undo step. Unless the closure returns `Ok`, the
//! steps are replayed in reverse when the writer is dropped, restoring the
//! exact prior contents. This covers a panicking closure too.

use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn, counter_or_first};
use crate::types::{
    Run, RunId, SimtreeError, Simulation, SimulationId, StateId, StateNode, TrajectoryEntry,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

type ChildKey = (StateId, u64, StateId);

#[derive(Debug, Default)]
struct Tables {
    states: BTreeMap<StateId, StateNode>,
    children: BTreeSet<ChildKey>,
    simulations: BTreeMap<SimulationId, Simulation>,
    runs: BTreeMap<RunId, Run>,
    runs_by_simulation: BTreeSet<(SimulationId, RunId)>,
    sequence: BTreeMap<(RunId, u64), TrajectoryEntry>,
    state_runs: BTreeMap<(StateId, RunId), u64>,
    counters: BTreeMap<IdKind, u64>,
}

impl ReadTxn for Tables {
    fn state(&self, id: StateId) -> Result<Option<StateNode>, SimtreeError> {
        Ok(self.states.get(&id).cloned())
    }

    fn states_from(&self, start: StateId, limit: usize) -> Result<Vec<StateNode>, SimtreeError> {
        Ok(self
            .states
            .range(start..)
            .take(limit)
            .map(|(_, node)| node.clone())
            .collect())
    }

    fn child_ids(&self, parent: StateId) -> Result<Vec<StateId>, SimtreeError> {
        Ok(self
            .children
            .range((parent, 0, StateId(0))..=(parent, u64::MAX, StateId(u64::MAX)))
            .map(|&(_, _, child)| child)
            .collect())
    }

    fn state_count(&self) -> Result<u64, SimtreeError> {
        Ok(self.states.len() as u64)
    }

    fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, SimtreeError> {
        Ok(self.simulations.get(&id).cloned())
    }

    fn simulations(&self) -> Result<Vec<Simulation>, SimtreeError> {
        Ok(self.simulations.values().cloned().collect())
    }

    fn run(&self, id: RunId) -> Result<Option<Run>, SimtreeError> {
        Ok(self.runs.get(&id).cloned())
    }

    fn runs(&self) -> Result<Vec<Run>, SimtreeError> {
        Ok(self.runs.values().cloned().collect())
    }

    fn run_ids_for_simulation(&self, simulation: SimulationId) -> Result<Vec<RunId>, SimtreeError> {
        Ok(self
            .runs_by_simulation
            .range((simulation, RunId(0))..=(simulation, RunId(u64::MAX)))
            .map(|&(_, run)| run)
            .collect())
    }

    fn entries_from(
        &self,
        run: RunId,
        start: u64,
        limit: usize,
    ) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
        Ok(self
            .sequence
            .range((run, start)..=(run, u64::MAX))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn last_entry(&self, run: RunId) -> Result<Option<TrajectoryEntry>, SimtreeError> {
        Ok(self
            .sequence
            .range((run, 0)..=(run, u64::MAX))
            .next_back()
            .map(|(_, entry)| entry.clone()))
    }

    fn position_of(&self, run: RunId, state: StateId) -> Result<Option<u64>, SimtreeError> {
        Ok(self.state_runs.get(&(state, run)).copied())
    }

    fn runs_containing(&self, state: StateId) -> Result<Vec<RunId>, SimtreeError> {
        Ok(self
            .state_runs
            .range((state, RunId(0))..=(state, RunId(u64::MAX)))
            .map(|(&(_, run), _)| run)
            .collect())
    }

    fn peek_next_id(&self, kind: IdKind) -> Result<u64, SimtreeError> {
        Ok(counter_or_first(self.counters.get(&kind).copied()))
    }
}

// =============================================================================
// WRITE TRANSACTION
// =============================================================================

/// Inverse of one mutation.
#[derive(Debug)]
enum Undo {
    State(StateId, Option<StateNode>),
    ChildAdded(ChildKey),
    Simulation(SimulationId, Option<Simulation>),
    Run(RunId, Option<Run>),
    RunIndexAdded((SimulationId, RunId)),
    Entry((RunId, u64), Option<TrajectoryEntry>),
    StateRun((StateId, RunId), Option<u64>),
    Counter(IdKind, Option<u64>),
}

struct MemoryWriter<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
}

impl MemoryWriter<'_> {
    /// Keep every change made so far.
    fn commit(&mut self) {
        self.undo.clear();
    }

    fn rollback(&mut self) {
        let tables = &mut *self.tables;
        for step in self.undo.drain(..).rev() {
            match step {
                Undo::State(id, prev) => restore(&mut tables.states, id, prev),
                Undo::ChildAdded(key) => {
                    tables.children.remove(&key);
                }
                Undo::Simulation(id, prev) => restore(&mut tables.simulations, id, prev),
                Undo::Run(id, prev) => restore(&mut tables.runs, id, prev),
                Undo::RunIndexAdded(key) => {
                    tables.runs_by_simulation.remove(&key);
                }
                Undo::Entry(key, prev) => restore(&mut tables.sequence, key, prev),
                Undo::StateRun(key, prev) => restore(&mut tables.state_runs, key, prev),
                Undo::Counter(kind, prev) => restore(&mut tables.counters, kind, prev),
            }
        }
    }

    fn set_counter(&mut self, kind: IdKind, next: u64) {
        let prev = self.tables.counters.insert(kind, next);
        self.undo.push(Undo::Counter(kind, prev));
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl ReadTxn for MemoryWriter<'_> {
    fn state(&self, id: StateId) -> Result<Option<StateNode>, SimtreeError> {
        self.tables.state(id)
    }

    fn states_from(&self, start: StateId, limit: usize) -> Result<Vec<StateNode>, SimtreeError> {
        self.tables.states_from(start, limit)
    }

    fn child_ids(&self, parent: StateId) -> Result<Vec<StateId>, SimtreeError> {
        self.tables.child_ids(parent)
    }

    fn state_count(&self) -> Result<u64, SimtreeError> {
        self.tables.state_count()
    }

    fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, SimtreeError> {
        self.tables.simulation(id)
    }

    fn simulations(&self) -> Result<Vec<Simulation>, SimtreeError> {
        self.tables.simulations()
    }

    fn run(&self, id: RunId) -> Result<Option<Run>, SimtreeError> {
        self.tables.run(id)
    }

    fn runs(&self) -> Result<Vec<Run>, SimtreeError> {
        self.tables.runs()
    }

    fn run_ids_for_simulation(&self, simulation: SimulationId) -> Result<Vec<RunId>, SimtreeError> {
        self.tables.run_ids_for_simulation(simulation)
    }

    fn entries_from(
        &self,
        run: RunId,
        start: u64,
        limit: usize,
    ) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
        self.tables.entries_from(run, start, limit)
    }

    fn last_entry(&self, run: RunId) -> Result<Option<TrajectoryEntry>, SimtreeError> {
        self.tables.last_entry(run)
    }

    fn position_of(&self, run: RunId, state: StateId) -> Result<Option<u64>, SimtreeError> {
        self.tables.position_of(run, state)
    }

    fn runs_containing(&self, state: StateId) -> Result<Vec<RunId>, SimtreeError> {
        self.tables.runs_containing(state)
    }

    fn peek_next_id(&self, kind: IdKind) -> Result<u64, SimtreeError> {
        self.tables.peek_next_id(kind)
    }
}

impl WriteTxn for MemoryWriter<'_> {
    fn allocate_id(&mut self, kind: IdKind) -> Result<u64, SimtreeError> {
        let id = self.tables.peek_next_id(kind)?;
        self.set_counter(kind, id.saturating_add(1));
        Ok(id)
    }

    fn reserve_ids(&mut self, kind: IdKind, next: u64) -> Result<(), SimtreeError> {
        if next > self.tables.peek_next_id(kind)? {
            self.set_counter(kind, next);
        }
        Ok(())
    }

    fn put_state(&mut self, node: &StateNode) -> Result<(), SimtreeError> {
        let prev = self.tables.states.insert(node.id, node.clone());
        self.undo.push(Undo::State(node.id, prev));
        if let Some(parent) = node.parent_id {
            let key = (parent, node.step_number, node.id);
            if self.tables.children.insert(key) {
                self.undo.push(Undo::ChildAdded(key));
            }
        }
        Ok(())
    }

    fn put_simulation(&mut self, simulation: &Simulation) -> Result<(), SimtreeError> {
        let prev = self
            .tables
            .simulations
            .insert(simulation.id, simulation.clone());
        self.undo.push(Undo::Simulation(simulation.id, prev));
        Ok(())
    }

    fn put_run(&mut self, run: &Run) -> Result<(), SimtreeError> {
        let prev = self.tables.runs.insert(run.id, run.clone());
        self.undo.push(Undo::Run(run.id, prev));
        let key = (run.simulation_id, run.id);
        if self.tables.runs_by_simulation.insert(key) {
            self.undo.push(Undo::RunIndexAdded(key));
        }
        Ok(())
    }

    fn put_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), SimtreeError> {
        let key = (entry.run_id, entry.sequence_order);
        let prev = self.tables.sequence.insert(key, entry.clone());
        self.undo.push(Undo::Entry(key, prev));

        let index_key = (entry.state_id, entry.run_id);
        let prev = self
            .tables
            .state_runs
            .insert(index_key, entry.sequence_order);
        self.undo.push(Undo::StateRun(index_key, prev));
        Ok(())
    }
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// In-memory repository.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryStore {
    fn read<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T, SimtreeError>,
    {
        let tables = self.tables.read();
        f(&*tables)
    }

    fn write<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T, SimtreeError>,
    {
        let mut tables = self.tables.write();
        let mut writer = MemoryWriter {
            tables: &mut *tables,
            undo: Vec::new(),
        };
        let result = f(&mut writer);
        if result.is_ok() {
            writer.commit();
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use chrono::Utc;

    fn node(id: u64, parent: Option<u64>, step: u64) -> StateNode {
        StateNode {
            id: StateId(id),
            parent_id: parent.map(StateId),
            step_number: step,
            observation: Payload::null(),
            action: None,
            reward: None,
            done: false,
            truncated: false,
            info: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn allocate_ids_are_sequential() {
        let store = MemoryStore::new();
        let ids = store
            .write(|txn| {
                let a = txn.allocate_id(IdKind::State)?;
                let b = txn.allocate_id(IdKind::State)?;
                let r = txn.allocate_id(IdKind::Run)?;
                Ok((a, b, r))
            })
            .expect("write");
        assert_eq!(ids, (1, 2, 1));
    }

    #[test]
    fn failed_write_rolls_back_everything() {
        let store = MemoryStore::new();
        store
            .write(|txn| txn.put_state(&node(1, None, 0)))
            .expect("seed");

        let result: Result<(), _> = store.write(|txn| {
            txn.allocate_id(IdKind::State)?;
            txn.put_state(&node(2, Some(1), 1))?;
            txn.put_state(&node(1, None, 7))?;
            Err(SimtreeError::InvalidInput("abort".into()))
        });
        assert!(result.is_err());

        store
            .read(|txn| {
                assert_eq!(txn.state_count()?, 1);
                assert_eq!(txn.state(StateId(1))?.expect("kept").step_number, 0);
                assert!(txn.child_ids(StateId(1))?.is_empty());
                assert_eq!(txn.peek_next_id(IdKind::State)?, 1);
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn children_ordered_by_step_then_id() {
        let store = MemoryStore::new();
        store
            .write(|txn| {
                txn.put_state(&node(1, None, 0))?;
                txn.put_state(&node(2, Some(1), 5))?;
                txn.put_state(&node(3, Some(1), 1))?;
                txn.put_state(&node(4, Some(1), 1))
            })
            .expect("write");
        let children = store.read(|txn| txn.child_ids(StateId(1))).expect("read");
        assert_eq!(children, vec![StateId(3), StateId(4), StateId(2)]);
    }

    #[test]
    fn reserve_ids_never_lowers_counter() {
        let store = MemoryStore::new();
        store
            .write(|txn| {
                txn.reserve_ids(IdKind::Entry, 10)?;
                txn.reserve_ids(IdKind::Entry, 3)
            })
            .expect("write");
        let next = store
            .read(|txn| txn.peek_next_id(IdKind::Entry))
            .expect("read");
        assert_eq!(next, 10);
    }

    #[test]
    fn panicking_write_rolls_back() {
        let store = MemoryStore::new();
        store
            .write(|txn| txn.put_state(&node(1, None, 0)))
            .expect("seed");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), SimtreeError> = store.write(|txn| {
                txn.allocate_id(IdKind::State)?;
                txn.put_state(&node(2, Some(1), 1))?;
                panic!("writer died mid-transaction");
            });
        }));
        assert!(outcome.is_err());

        store
            .read(|txn| {
                assert_eq!(txn.state_count()?, 1);
                assert!(txn.child_ids(StateId(1))?.is_empty());
                assert_eq!(txn.peek_next_id(IdKind::State)?, 1);
                Ok(())
            })
            .expect("read");
    }
}
