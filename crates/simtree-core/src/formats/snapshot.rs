//! # Snapshot Format
//!
//! Whole-store export and import.
//!
//! Binary format: Header (5 bytes) + postcard-serialized [`Snapshot`].
//! - 4 bytes: Magic ("SIMT")
//! - 1 byte: Version
//!
//! A JSON rendering of the same structure is available for inspection and
//! interchange. Size and header are validated before any payload is decoded.

use crate::nodes::StateStore;
use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES, MAX_SNAPSHOT_SIZE, PAGE_SIZE};
use crate::registry::RunRegistry;
use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn};
use crate::sequence::SequenceIndex;
use crate::types::{
    Run, RunId, SimtreeError, Simulation, StateId, StateNode, TrajectoryEntry,
};
use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 5;

// =============================================================================
// HEADER
// =============================================================================

/// The header precedes all binary snapshot data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl SnapshotHeader {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            magic: *MAGIC_BYTES,
            version: FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), SimtreeError> {
        if &self.magic != MAGIC_BYTES {
            return Err(SimtreeError::SerializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != FORMAT_VERSION {
            return Err(SimtreeError::SerializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimtreeError> {
        if bytes.len() < HEADER_LEN {
            return Err(SimtreeError::SerializationError(
                "Header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Identifier counters at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextIds {
    pub state: u64,
    pub run: u64,
    pub simulation: u64,
    pub entry: u64,
}

impl NextIds {
    const fn get(&self, kind: IdKind) -> u64 {
        match kind {
            IdKind::State => self.state,
            IdKind::Run => self.run,
            IdKind::Simulation => self.simulation,
            IdKind::Entry => self.entry,
        }
    }
}

/// Complete contents of a store.
///
/// Every list is ascending by id; `entries` is ordered by
/// `(run_id, sequence_order)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u8,
    pub simulations: Vec<Simulation>,
    pub states: Vec<StateNode>,
    pub runs: Vec<Run>,
    pub entries: Vec<TrajectoryEntry>,
    pub next_ids: NextIds,
}

impl Snapshot {
    /// Read the entire store in one transaction.
    pub fn capture<R: Repository>(repo: &R) -> Result<Self, SimtreeError> {
        repo.read(|txn| {
            let simulations = txn.simulations()?;
            let runs = txn.runs()?;
            let mut states = Vec::new();
            let mut next = StateId(0);
            loop {
                let page = txn.states_from(next, PAGE_SIZE)?;
                let Some(last) = page.last() else { break };
                next = StateId(last.id.0.saturating_add(1));
                let full = page.len() == PAGE_SIZE;
                states.extend(page);
                if !full {
                    break;
                }
            }
            let mut entries = Vec::new();
            for run in &runs {
                entries.extend(SequenceIndex::entries_in(txn, run.id)?);
            }
            Ok(Self {
                version: FORMAT_VERSION,
                simulations,
                states,
                runs,
                entries,
                next_ids: NextIds {
                    state: txn.peek_next_id(IdKind::State)?,
                    run: txn.peek_next_id(IdKind::Run)?,
                    simulation: txn.peek_next_id(IdKind::Simulation)?,
                    entry: txn.peek_next_id(IdKind::Entry)?,
                },
            })
        })
    }

    /// Load this snapshot into an empty repository.
    ///
    /// Referential integrity is checked while loading; on any error the
    /// target is left empty.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the target already holds data, or a trajectory is
    ///   not numbered `0..len`
    /// - `InvalidParent`, `StateNotFound`, `RunNotFound`,
    ///   `SimulationNotFound`, `DuplicateState` for dangling references
    /// - `InvalidBranchPoint` if a branch point is missing from the parent
    ///   run's trajectory, `InvalidInput` for other broken run links
    pub fn restore_into<R: Repository>(&self, repo: &R) -> Result<(), SimtreeError> {
        repo.write(|txn| self.restore_in(txn))?;
        tracing::info!(
            simulations = self.simulations.len(),
            states = self.states.len(),
            runs = self.runs.len(),
            entries = self.entries.len(),
            "snapshot restored"
        );
        Ok(())
    }

    fn restore_in<T: WriteTxn + ?Sized>(&self, txn: &mut T) -> Result<(), SimtreeError> {
        if self.version != FORMAT_VERSION {
            return Err(SimtreeError::SerializationError(format!(
                "Unsupported snapshot version: {}",
                self.version
            )));
        }
        if txn.state_count()? > 0 || !txn.runs()?.is_empty() || !txn.simulations()?.is_empty() {
            return Err(SimtreeError::InvalidInput(
                "snapshots can only be restored into an empty store".into(),
            ));
        }

        for simulation in &self.simulations {
            txn.put_simulation(simulation)?;
        }
        for state in &self.states {
            // Parents always carry smaller ids, so they are already loaded.
            if let Some(parent) = state.parent_id
                && txn.state(parent)?.is_none()
            {
                return Err(SimtreeError::InvalidParent(parent));
            }
            txn.put_state(state)?;
        }
        for run in &self.runs {
            if txn.simulation(run.simulation_id)?.is_none() {
                return Err(SimtreeError::SimulationNotFound(run.simulation_id));
            }
            StateStore::require_in(&*txn, run.root_state_id)?;
            if let Some(parent) = run.parent_run_id {
                RunRegistry::require_in(&*txn, parent)?;
            }
            txn.put_run(run)?;
        }

        let mut expected: Option<(RunId, u64)> = None;
        for entry in &self.entries {
            let order = match expected {
                Some((run, next)) if run == entry.run_id => next,
                _ => 0,
            };
            if entry.sequence_order != order {
                return Err(SimtreeError::InvalidInput(format!(
                    "trajectory of run {} is not numbered contiguously",
                    entry.run_id
                )));
            }
            RunRegistry::require_in(&*txn, entry.run_id)?;
            StateStore::require_in(&*txn, entry.state_id)?;
            if txn.position_of(entry.run_id, entry.state_id)?.is_some() {
                return Err(SimtreeError::DuplicateState {
                    run: entry.run_id,
                    state: entry.state_id,
                });
            }
            txn.put_entry(entry)?;
            expected = Some((entry.run_id, order.saturating_add(1)));
        }
        for run in &self.runs {
            check_run_links(&*txn, run)?;
        }

        let max_ids = [
            (IdKind::State, self.states.iter().map(|s| s.id.0).max()),
            (IdKind::Run, self.runs.iter().map(|r| r.id.0).max()),
            (
                IdKind::Simulation,
                self.simulations.iter().map(|s| s.id.0).max(),
            ),
            (IdKind::Entry, self.entries.iter().map(|e| e.id.0).max()),
        ];
        for (kind, max) in max_ids {
            let floor = max.map_or(0, |m| m.saturating_add(1));
            txn.reserve_ids(kind, self.next_ids.get(kind).max(floor))?;
        }
        Ok(())
    }

    /// Encode as header + postcard payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SimtreeError> {
        let payload = postcard::to_stdvec(self).map_err(SimtreeError::codec)?;
        let mut result = Vec::with_capacity(HEADER_LEN + payload.len());
        result.extend_from_slice(&SnapshotHeader::new().to_bytes());
        result.extend_from_slice(&payload);
        Ok(result)
    }

    /// Decode from header + postcard payload.
    ///
    /// Size limits and the header are validated before the payload is
    /// touched.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimtreeError> {
        if bytes.len() < HEADER_LEN {
            return Err(SimtreeError::SerializationError(format!(
                "Data too short: minimum {HEADER_LEN} bytes required"
            )));
        }
        if bytes.len() > MAX_SNAPSHOT_SIZE {
            return Err(SimtreeError::SerializationError(format!(
                "Data size {} bytes exceeds maximum allowed {} bytes",
                bytes.len(),
                MAX_SNAPSHOT_SIZE
            )));
        }
        SnapshotHeader::from_bytes(bytes)?.validate()?;
        postcard::from_bytes(&bytes[HEADER_LEN..]).map_err(|e| {
            SimtreeError::SerializationError(format!("Failed to decode snapshot: {e}"))
        })
    }

    pub fn to_json(&self) -> Result<String, SimtreeError> {
        serde_json::to_string_pretty(self).map_err(SimtreeError::codec)
    }

    pub fn from_json(text: &str) -> Result<Self, SimtreeError> {
        if text.len() > MAX_SNAPSHOT_SIZE {
            return Err(SimtreeError::SerializationError(
                "JSON snapshot exceeds maximum size".to_string(),
            ));
        }
        serde_json::from_str(text).map_err(SimtreeError::codec)
    }

    /// Structural checksum over identifiers, links, and orders.
    ///
    /// FNV-1a over every field in record order, so duplicated or reordered
    /// records change the result. Equal for two snapshots of the same
    /// history regardless of payload encoding; not collision resistant,
    /// use [`Snapshot::crypto_hash`] for integrity.
    #[must_use]
    pub fn checksum(&self) -> u64 {
        let mut hash = Fnv::new();
        hash.add(self.simulations.len() as u64);
        for sim in &self.simulations {
            hash.add(sim.id.0);
        }
        hash.add(self.states.len() as u64);
        for state in &self.states {
            hash.add(state.id.0);
            hash.add(state.parent_id.map_or(0, |p| p.0));
            hash.add(state.step_number);
        }
        hash.add(self.runs.len() as u64);
        for run in &self.runs {
            hash.add(run.id.0);
            hash.add(run.root_state_id.0);
            hash.add(run.parent_run_id.map_or(0, |p| p.0));
        }
        hash.add(self.entries.len() as u64);
        for entry in &self.entries {
            hash.add(entry.run_id.0);
            hash.add(entry.state_id.0);
            hash.add(entry.sequence_order);
        }
        hash.finish()
    }

    /// BLAKE3 hash of the binary encoding, as 64 hex characters.
    #[cfg(feature = "crypto-hash")]
    pub fn crypto_hash(&self) -> Result<String, SimtreeError> {
        let bytes = self.to_bytes()?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv(u64);

impl Fnv {
    const fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn add(&mut self, value: u64) {
        for byte in value.to_le_bytes() {
            self.0 = (self.0 ^ u64::from(byte)).wrapping_mul(FNV_PRIME);
        }
    }

    const fn finish(&self) -> u64 {
        self.0
    }
}

/// A restored run must satisfy the same links branching establishes.
fn check_run_links<T: ReadTxn + ?Sized>(txn: &T, run: &Run) -> Result<(), SimtreeError> {
    if txn.position_of(run.id, run.current_state_id)?.is_none() {
        return Err(SimtreeError::InvalidInput(format!(
            "run {} points at state {} outside its trajectory",
            run.id, run.current_state_id
        )));
    }
    match (run.parent_run_id, run.branch_point_state_id) {
        (None, None) => Ok(()),
        (Some(parent), Some(point)) => {
            if point != run.root_state_id {
                return Err(SimtreeError::InvalidInput(format!(
                    "run {} is rooted at {} but branched at {}",
                    run.id, run.root_state_id, point
                )));
            }
            if txn.position_of(parent, point)?.is_none() {
                return Err(SimtreeError::InvalidBranchPoint {
                    run: parent,
                    state: point,
                });
            }
            Ok(())
        }
        _ => Err(SimtreeError::InvalidInput(format!(
            "run {} has a parent run without a branch point, or the reverse",
            run.id
        ))),
    }
}
