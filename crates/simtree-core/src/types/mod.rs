//! # Core Type Definitions
//!
//! This module contains all core types for the Simtree history store:
//! - Identifiers (`StateId`, `RunId`, `SimulationId`, `EntryId`)
//! - Opaque payloads (`Payload`, `ConfigMap`)
//! - Records (`StateNode`, `Run`, `TrajectoryEntry`, `Simulation`) in [`records`]
//! - Error types (`SimtreeError`, `ErrorKind`)
//!
//! ## Ordering Guarantees
//!
//! Identifiers implement `Ord` and are allocated in increasing order, so
//! every `BTreeMap`/`BTreeSet` keyed by them iterates in creation order.

mod records;

pub use records::{
    NewRun, NewSimulation, NewState, Run, RunFilter, RunStatus, Simulation, StateNode,
    TrajectoryEntry,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Unique identifier of a recorded state. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u64);

/// Unique identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

/// Unique identifier of a simulation template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimulationId(pub u64);

/// Unique identifier of a trajectory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

macro_rules! display_id {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_id!(StateId, RunId, SimulationId, EntryId);

// =============================================================================
// OPAQUE PAYLOADS
// =============================================================================

/// Opaque structured value supplied by callers (observations, actions,
/// configuration values, metadata). The store never interprets it, except
/// for scalar run rewards.
///
/// Human-readable formats (JSON) see the value as-is. Binary formats store
/// it as an encoded JSON string, since they cannot describe arbitrary
/// structures on their own.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    /// Wrap a JSON value.
    #[must_use]
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// The null payload.
    #[must_use]
    pub const fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    /// Borrow the underlying value.
    #[must_use]
    pub const fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Numeric view of the payload, if it is a JSON number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(serde_json::Value::from(value))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let encoded = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&encoded)
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            serde_json::Value::deserialize(deserializer).map(Self)
        } else {
            let encoded = String::deserialize(deserializer)?;
            serde_json::from_str(&encoded)
                .map(Self)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Flat mapping from configuration key to value.
///
/// Merging is shallow: a key present in a later layer replaces the whole
/// value from an earlier layer.
pub type ConfigMap = BTreeMap<String, Payload>;

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Simtree store.
///
/// Every failed operation leaves the store unchanged.
#[derive(Debug, Error)]
pub enum SimtreeError {
    #[error("State not found: {0}")]
    StateNotFound(StateId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Simulation not found: {0}")]
    SimulationNotFound(SimulationId),

    /// A referenced parent state does not exist.
    #[error("Invalid parent: state {0} does not exist")]
    InvalidParent(StateId),

    /// The requested branch point is not in the parent run's trajectory.
    #[error("Invalid branch point: state {state} is not part of run {run}")]
    InvalidBranchPoint { run: RunId, state: StateId },

    /// Prefix copy was asked to stop at a state the source run never visited.
    #[error("Branch point {state} not found in source run {run}")]
    BranchPointNotInSource { run: RunId, state: StateId },

    #[error("State {state} already belongs to run {run}")]
    DuplicateState { run: RunId, state: StateId },

    #[error("Run {run} is {status}; only active runs accept new states")]
    RunNotActive { run: RunId, status: RunStatus },

    #[error("Illegal status transition for run {run}: {from} -> {to}")]
    IllegalStatusTransition {
        run: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    /// The parent chain starting at this state revisits a state.
    #[error("Cycle detected in state lineage starting at {0}")]
    CycleDetected(StateId),

    /// The parent-run chain starting at this run revisits a run.
    #[error("Cycle detected in run lineage starting at {0}")]
    RunLineageCycle(RunId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The underlying storage could not complete the transaction.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Coarse classification of [`SimtreeError`], used by callers that map
/// errors onto another protocol (HTTP status codes, exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidReference,
    Conflict,
    IllegalTransition,
    Corruption,
    InvalidInput,
    StorageUnavailable,
}

impl SimtreeError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StateNotFound(_) | Self::RunNotFound(_) | Self::SimulationNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::InvalidParent(_)
            | Self::InvalidBranchPoint { .. }
            | Self::BranchPointNotInSource { .. } => ErrorKind::InvalidReference,
            Self::DuplicateState { .. } => ErrorKind::Conflict,
            Self::RunNotActive { .. } | Self::IllegalStatusTransition { .. } => {
                ErrorKind::IllegalTransition
            }
            Self::CycleDetected(_) | Self::RunLineageCycle(_) | Self::SerializationError(_) => {
                ErrorKind::Corruption
            }
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only storage-level failures are transient; every other error is a
    /// deterministic consequence of the inputs and current contents.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::StorageUnavailable)
    }

    pub(crate) fn storage(err: impl fmt::Display) -> Self {
        Self::StorageUnavailable(err.to_string())
    }

    pub(crate) fn codec(err: impl fmt::Display) -> Self {
        Self::SerializationError(err.to_string())
    }
}
