//! redb table layout.
//!
//! Records are postcard-encoded. Secondary indexes use composite keys with
//! `()` values so that per-parent and per-run lookups are range scans.

use redb::TableDefinition;

/// StateId -> encoded `StateNode`
pub(crate) const STATES: TableDefinition<u64, &[u8]> = TableDefinition::new("states");

/// (parent_id, step_number, child_id) -> ()
pub(crate) const STATE_CHILDREN: TableDefinition<(u64, u64, u64), ()> =
    TableDefinition::new("state_children");

/// SimulationId -> encoded `Simulation`
pub(crate) const SIMULATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("simulations");

/// RunId -> encoded `Run`
pub(crate) const RUNS: TableDefinition<u64, &[u8]> = TableDefinition::new("runs");

/// (simulation_id, run_id) -> ()
pub(crate) const RUNS_BY_SIMULATION: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("runs_by_simulation");

/// (run_id, sequence_order) -> encoded `TrajectoryEntry`
pub(crate) const SEQUENCE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("sequence");

/// (state_id, run_id) -> sequence_order
pub(crate) const STATE_RUNS: TableDefinition<(u64, u64), u64> = TableDefinition::new("state_runs");

/// Counter name -> next free identifier
pub(crate) const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");
