//! # redb-backed Storage
//!
//! A disk-backed repository using the redb embedded database.
//!
//! redb provides what the store relies on:
//! - ACID transactions (a closure returning `Err` aborts the transaction)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Records are postcard-encoded; see [`super::tables`] for the layout.

use super::tables::{
    METADATA, RUNS, RUNS_BY_SIMULATION, SEQUENCE, SIMULATIONS, STATE_CHILDREN, STATE_RUNS, STATES,
};
use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn, counter_or_first};
use crate::types::{
    Run, RunId, SimtreeError, Simulation, SimulationId, StateId, StateNode, TrajectoryEntry,
};
use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable,
    ReadableTableMetadata, Table, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

// =============================================================================
// CODEC
// =============================================================================

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SimtreeError> {
    postcard::to_allocvec(value).map_err(SimtreeError::codec)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SimtreeError> {
    postcard::from_bytes(bytes).map_err(SimtreeError::codec)
}

// =============================================================================
// TABLE HELPERS (shared by read and write transactions)
// =============================================================================

fn get_record<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    key: u64,
) -> Result<Option<T>, SimtreeError> {
    match table.get(key).map_err(SimtreeError::storage)? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn scan_records<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    start: u64,
    limit: usize,
) -> Result<Vec<T>, SimtreeError> {
    let mut records = Vec::new();
    for item in table
        .range(start..)
        .map_err(SimtreeError::storage)?
        .take(limit)
    {
        let (_, value) = item.map_err(SimtreeError::storage)?;
        records.push(decode(value.value())?);
    }
    Ok(records)
}

fn scan_entries(
    table: &impl ReadableTable<(u64, u64), &'static [u8]>,
    run: RunId,
    start: u64,
    limit: usize,
) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
    let mut entries = Vec::new();
    for item in table
        .range((run.0, start)..=(run.0, u64::MAX))
        .map_err(SimtreeError::storage)?
        .take(limit)
    {
        let (_, value) = item.map_err(SimtreeError::storage)?;
        entries.push(decode(value.value())?);
    }
    Ok(entries)
}

fn last_entry_of(
    table: &impl ReadableTable<(u64, u64), &'static [u8]>,
    run: RunId,
) -> Result<Option<TrajectoryEntry>, SimtreeError> {
    let last = table
        .range((run.0, 0)..=(run.0, u64::MAX))
        .map_err(SimtreeError::storage)?
        .next_back();
    match last {
        Some(item) => {
            let (_, value) = item.map_err(SimtreeError::storage)?;
            decode(value.value()).map(Some)
        }
        None => Ok(None),
    }
}

fn child_ids_of(
    table: &impl ReadableTable<(u64, u64, u64), ()>,
    parent: StateId,
) -> Result<Vec<StateId>, SimtreeError> {
    let mut children = Vec::new();
    for item in table
        .range((parent.0, 0, 0)..=(parent.0, u64::MAX, u64::MAX))
        .map_err(SimtreeError::storage)?
    {
        let (key, _) = item.map_err(SimtreeError::storage)?;
        children.push(StateId(key.value().2));
    }
    Ok(children)
}

fn runs_of_simulation(
    table: &impl ReadableTable<(u64, u64), ()>,
    simulation: SimulationId,
) -> Result<Vec<RunId>, SimtreeError> {
    let mut runs = Vec::new();
    for item in table
        .range((simulation.0, 0)..=(simulation.0, u64::MAX))
        .map_err(SimtreeError::storage)?
    {
        let (key, _) = item.map_err(SimtreeError::storage)?;
        runs.push(RunId(key.value().1));
    }
    Ok(runs)
}

fn runs_with_state(
    table: &impl ReadableTable<(u64, u64), u64>,
    state: StateId,
) -> Result<Vec<RunId>, SimtreeError> {
    let mut runs = Vec::new();
    for item in table
        .range((state.0, 0)..=(state.0, u64::MAX))
        .map_err(SimtreeError::storage)?
    {
        let (key, _) = item.map_err(SimtreeError::storage)?;
        runs.push(RunId(key.value().1));
    }
    Ok(runs)
}

fn position_in(
    table: &impl ReadableTable<(u64, u64), u64>,
    run: RunId,
    state: StateId,
) -> Result<Option<u64>, SimtreeError> {
    Ok(table
        .get((state.0, run.0))
        .map_err(SimtreeError::storage)?
        .map(|v| v.value()))
}

fn counter(
    table: &impl ReadableTable<&'static str, u64>,
    kind: IdKind,
) -> Result<u64, SimtreeError> {
    let value = table
        .get(kind.counter_key())
        .map_err(SimtreeError::storage)?
        .map(|v| v.value());
    Ok(counter_or_first(value))
}

// =============================================================================
// TRANSACTIONS
// =============================================================================

struct RedbReader {
    states: ReadOnlyTable<u64, &'static [u8]>,
    children: ReadOnlyTable<(u64, u64, u64), ()>,
    simulations: ReadOnlyTable<u64, &'static [u8]>,
    runs: ReadOnlyTable<u64, &'static [u8]>,
    runs_by_simulation: ReadOnlyTable<(u64, u64), ()>,
    sequence: ReadOnlyTable<(u64, u64), &'static [u8]>,
    state_runs: ReadOnlyTable<(u64, u64), u64>,
    metadata: ReadOnlyTable<&'static str, u64>,
}

impl RedbReader {
    fn open(txn: &ReadTransaction) -> Result<Self, SimtreeError> {
        Ok(Self {
            states: txn.open_table(STATES).map_err(SimtreeError::storage)?,
            children: txn.open_table(STATE_CHILDREN).map_err(SimtreeError::storage)?,
            simulations: txn.open_table(SIMULATIONS).map_err(SimtreeError::storage)?,
            runs: txn.open_table(RUNS).map_err(SimtreeError::storage)?,
            runs_by_simulation: txn
                .open_table(RUNS_BY_SIMULATION)
                .map_err(SimtreeError::storage)?,
            sequence: txn.open_table(SEQUENCE).map_err(SimtreeError::storage)?,
            state_runs: txn.open_table(STATE_RUNS).map_err(SimtreeError::storage)?,
            metadata: txn.open_table(METADATA).map_err(SimtreeError::storage)?,
        })
    }
}

struct RedbWriter<'txn> {
    states: Table<'txn, u64, &'static [u8]>,
    children: Table<'txn, (u64, u64, u64), ()>,
    simulations: Table<'txn, u64, &'static [u8]>,
    runs: Table<'txn, u64, &'static [u8]>,
    runs_by_simulation: Table<'txn, (u64, u64), ()>,
    sequence: Table<'txn, (u64, u64), &'static [u8]>,
    state_runs: Table<'txn, (u64, u64), u64>,
    metadata: Table<'txn, &'static str, u64>,
}

impl<'txn> RedbWriter<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self, SimtreeError> {
        Ok(Self {
            states: txn.open_table(STATES).map_err(SimtreeError::storage)?,
            children: txn.open_table(STATE_CHILDREN).map_err(SimtreeError::storage)?,
            simulations: txn.open_table(SIMULATIONS).map_err(SimtreeError::storage)?,
            runs: txn.open_table(RUNS).map_err(SimtreeError::storage)?,
            runs_by_simulation: txn
                .open_table(RUNS_BY_SIMULATION)
                .map_err(SimtreeError::storage)?,
            sequence: txn.open_table(SEQUENCE).map_err(SimtreeError::storage)?,
            state_runs: txn.open_table(STATE_RUNS).map_err(SimtreeError::storage)?,
            metadata: txn.open_table(METADATA).map_err(SimtreeError::storage)?,
        })
    }

    fn set_counter(&mut self, kind: IdKind, next: u64) -> Result<(), SimtreeError> {
        self.metadata
            .insert(kind.counter_key(), next)
            .map_err(SimtreeError::storage)?;
        Ok(())
    }
}

/// Both transaction kinds expose the same table fields.
macro_rules! impl_read_txn {
    ($ty:ty) => {
        impl ReadTxn for $ty {
            fn state(&self, id: StateId) -> Result<Option<StateNode>, SimtreeError> {
                get_record(&self.states, id.0)
            }

            fn states_from(
                &self,
                start: StateId,
                limit: usize,
            ) -> Result<Vec<StateNode>, SimtreeError> {
                scan_records(&self.states, start.0, limit)
            }

            fn child_ids(&self, parent: StateId) -> Result<Vec<StateId>, SimtreeError> {
                child_ids_of(&self.children, parent)
            }

            fn state_count(&self) -> Result<u64, SimtreeError> {
                self.states.len().map_err(SimtreeError::storage)
            }

            fn simulation(&self, id: SimulationId) -> Result<Option<Simulation>, SimtreeError> {
                get_record(&self.simulations, id.0)
            }

            fn simulations(&self) -> Result<Vec<Simulation>, SimtreeError> {
                scan_records(&self.simulations, 0, usize::MAX)
            }

            fn run(&self, id: RunId) -> Result<Option<Run>, SimtreeError> {
                get_record(&self.runs, id.0)
            }

            fn runs(&self) -> Result<Vec<Run>, SimtreeError> {
                scan_records(&self.runs, 0, usize::MAX)
            }

            fn run_ids_for_simulation(
                &self,
                simulation: SimulationId,
            ) -> Result<Vec<RunId>, SimtreeError> {
                runs_of_simulation(&self.runs_by_simulation, simulation)
            }

            fn entries_from(
                &self,
                run: RunId,
                start: u64,
                limit: usize,
            ) -> Result<Vec<TrajectoryEntry>, SimtreeError> {
                scan_entries(&self.sequence, run, start, limit)
            }

            fn last_entry(&self, run: RunId) -> Result<Option<TrajectoryEntry>, SimtreeError> {
                last_entry_of(&self.sequence, run)
            }

            fn position_of(
                &self,
                run: RunId,
                state: StateId,
            ) -> Result<Option<u64>, SimtreeError> {
                position_in(&self.state_runs, run, state)
            }

            fn runs_containing(&self, state: StateId) -> Result<Vec<RunId>, SimtreeError> {
                runs_with_state(&self.state_runs, state)
            }

            fn peek_next_id(&self, kind: IdKind) -> Result<u64, SimtreeError> {
                counter(&self.metadata, kind)
            }
        }
    };
}

impl_read_txn!(RedbReader);
impl_read_txn!(RedbWriter<'_>);

impl WriteTxn for RedbWriter<'_> {
    fn allocate_id(&mut self, kind: IdKind) -> Result<u64, SimtreeError> {
        let id = counter(&self.metadata, kind)?;
        self.set_counter(kind, id.saturating_add(1))?;
        Ok(id)
    }

    fn reserve_ids(&mut self, kind: IdKind, next: u64) -> Result<(), SimtreeError> {
        if next > counter(&self.metadata, kind)? {
            self.set_counter(kind, next)?;
        }
        Ok(())
    }

    fn put_state(&mut self, node: &StateNode) -> Result<(), SimtreeError> {
        let bytes = encode(node)?;
        self.states
            .insert(node.id.0, bytes.as_slice())
            .map_err(SimtreeError::storage)?;
        if let Some(parent) = node.parent_id {
            self.children
                .insert((parent.0, node.step_number, node.id.0), ())
                .map_err(SimtreeError::storage)?;
        }
        Ok(())
    }

    fn put_simulation(&mut self, simulation: &Simulation) -> Result<(), SimtreeError> {
        let bytes = encode(simulation)?;
        self.simulations
            .insert(simulation.id.0, bytes.as_slice())
            .map_err(SimtreeError::storage)?;
        Ok(())
    }

    fn put_run(&mut self, run: &Run) -> Result<(), SimtreeError> {
        let bytes = encode(run)?;
        self.runs
            .insert(run.id.0, bytes.as_slice())
            .map_err(SimtreeError::storage)?;
        self.runs_by_simulation
            .insert((run.simulation_id.0, run.id.0), ())
            .map_err(SimtreeError::storage)?;
        Ok(())
    }

    fn put_entry(&mut self, entry: &TrajectoryEntry) -> Result<(), SimtreeError> {
        let bytes = encode(entry)?;
        self.sequence
            .insert((entry.run_id.0, entry.sequence_order), bytes.as_slice())
            .map_err(SimtreeError::storage)?;
        self.state_runs
            .insert((entry.state_id.0, entry.run_id.0), entry.sequence_order)
            .map_err(SimtreeError::storage)?;
        Ok(())
    }
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// A disk-backed repository using redb.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SimtreeError> {
        let db = Database::create(path.as_ref()).map_err(SimtreeError::storage)?;

        // Create every table up front so read transactions can open them.
        let txn = db.begin_write().map_err(SimtreeError::storage)?;
        drop(RedbWriter::open(&txn)?);
        txn.commit().map_err(SimtreeError::storage)?;

        tracing::debug!(path = %path.as_ref().display(), "opened redb store");
        Ok(Self { db })
    }

    /// Reclaim free pages in the database file.
    ///
    /// Returns `true` if the file was compacted. Needs exclusive access,
    /// so no transaction may be open.
    pub fn compact(&mut self) -> Result<bool, SimtreeError> {
        let compacted = self.db.compact().map_err(SimtreeError::storage)?;
        tracing::info!(compacted, "redb store compacted");
        Ok(compacted)
    }
}

impl Repository for RedbStore {
    fn read<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&dyn ReadTxn) -> Result<T, SimtreeError>,
    {
        let txn = self.db.begin_read().map_err(SimtreeError::storage)?;
        let reader = RedbReader::open(&txn)?;
        f(&reader)
    }

    fn write<T, F>(&self, f: F) -> Result<T, SimtreeError>
    where
        F: FnOnce(&mut dyn WriteTxn) -> Result<T, SimtreeError>,
    {
        let txn = self.db.begin_write().map_err(SimtreeError::storage)?;
        let result = {
            let mut writer = RedbWriter::open(&txn)?;
            f(&mut writer)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(SimtreeError::storage)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::warn!(error = %abort_err, "failed to abort redb transaction");
                }
                Err(err)
            }
        }
    }
}
