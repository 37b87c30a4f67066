//! # Run Registry
//!
//! Creation, lookup, and lifecycle of [`Run`]s.
//!
//! Status changes follow [`RunStatus::can_transition_to`]; `completed_at`
//! is stamped when a run enters `completed` or `failed`.

use crate::catalog::SimulationCatalog;
use crate::nodes::StateStore;
use crate::primitives::{MAX_DESCRIPTION_LENGTH, MAX_NAME_LENGTH};
use crate::repository::{IdKind, ReadTxn, Repository, WriteTxn};
use crate::sequence::SequenceIndex;
use crate::types::{
    NewRun, Payload, Run, RunFilter, RunId, RunStatus, SimtreeError, StateNode,
};
use chrono::{DateTime, Utc};

/// Operations on runs.
pub struct RunRegistry;

impl RunRegistry {
    /// Create an origin run rooted at an existing state.
    ///
    /// The root state becomes trajectory entry 0 and the current state.
    /// `total_steps` starts at 0.
    ///
    /// # Errors
    ///
    /// - `SimulationNotFound` / `StateNotFound` for unknown ids
    /// - `InvalidInput` for an empty or oversized name
    pub fn create_origin<R: Repository>(repo: &R, new: NewRun) -> Result<Run, SimtreeError> {
        let run = repo.write(|txn| Self::create_origin_in(txn, new, Utc::now()))?;
        tracing::info!(
            run_id = %run.id,
            simulation_id = %run.simulation_id,
            root_state_id = %run.root_state_id,
            "run created"
        );
        Ok(run)
    }

    fn create_origin_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        new: NewRun,
        now: DateTime<Utc>,
    ) -> Result<Run, SimtreeError> {
        validate_name(&new.name)?;
        validate_description(new.description.as_deref())?;
        SimulationCatalog::require_in(&*txn, new.simulation_id)?;
        let root = StateStore::require_in(&*txn, new.root_state_id)?;

        let run = Run {
            id: RunId(txn.allocate_id(IdKind::Run)?),
            simulation_id: new.simulation_id,
            name: new.name,
            description: new.description,
            root_state_id: root.id,
            current_state_id: root.id,
            parent_run_id: None,
            branch_point_state_id: None,
            config_overrides: new.config_overrides,
            status: RunStatus::Active,
            total_steps: 0,
            total_reward: accumulate_reward(None, root.reward),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            metadata: new.metadata,
        };
        txn.put_run(&run)?;
        SequenceIndex::put_entry_in(txn, run.id, root.id, 0, now)?;
        Ok(run)
    }

    pub fn get<R: Repository>(repo: &R, id: RunId) -> Result<Run, SimtreeError> {
        repo.read(|txn| Self::require_in(txn, id))
    }

    pub(crate) fn require_in<T: ReadTxn + ?Sized>(txn: &T, id: RunId) -> Result<Run, SimtreeError> {
        txn.run(id)?.ok_or(SimtreeError::RunNotFound(id))
    }

    /// Runs matching `filter`, ascending by id.
    pub fn list<R: Repository>(repo: &R, filter: RunFilter) -> Result<Vec<Run>, SimtreeError> {
        repo.read(|txn| {
            let runs = match filter.simulation_id {
                Some(simulation) => {
                    SimulationCatalog::require_in(txn, simulation)?;
                    txn.run_ids_for_simulation(simulation)?
                        .into_iter()
                        .map(|id| Self::require_in(txn, id))
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => txn.runs()?,
            };
            Ok(runs.into_iter().filter(|r| filter.matches(r)).collect())
        })
    }

    /// Move a run to `to`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalStatusTransition` for any edge outside the lifecycle
    /// graph, including `x -> x`.
    pub fn transition<R: Repository>(
        repo: &R,
        id: RunId,
        to: RunStatus,
    ) -> Result<Run, SimtreeError> {
        let run = repo.write(|txn| Self::transition_in(txn, id, to, Utc::now()))?;
        tracing::info!(run_id = %id, status = %to, "run status changed");
        Ok(run)
    }

    fn transition_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        id: RunId,
        to: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<Run, SimtreeError> {
        let mut run = Self::require_in(&*txn, id)?;
        if !run.status.can_transition_to(to) {
            return Err(SimtreeError::IllegalStatusTransition {
                run: id,
                from: run.status,
                to,
            });
        }
        run.status = to;
        if to.is_terminal() {
            run.completed_at = Some(now);
        }
        txn.put_run(&run)?;
        Ok(run)
    }

    /// Mark a run completed, optionally recording a final reward.
    ///
    /// When `total_reward` is `None` the accumulated value is kept.
    pub fn complete<R: Repository>(
        repo: &R,
        id: RunId,
        total_reward: Option<Payload>,
    ) -> Result<Run, SimtreeError> {
        let run = repo.write(|txn| {
            let mut run = Self::transition_in(txn, id, RunStatus::Completed, Utc::now())?;
            if let Some(reward) = total_reward {
                run.total_reward = Some(reward);
                txn.put_run(&run)?;
            }
            Ok(run)
        })?;
        tracing::info!(run_id = %id, total_steps = run.total_steps, "run completed");
        Ok(run)
    }

    /// Record that `state` was appended to `run`.
    pub(crate) fn set_current_state_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        run: &mut Run,
        state: &StateNode,
    ) -> Result<(), SimtreeError> {
        run.current_state_id = state.id;
        run.total_steps = run.total_steps.saturating_add(1);
        run.total_reward = accumulate_reward(run.total_reward.take(), state.reward);
        txn.put_run(run)
    }
}

/// Add `reward` to a scalar running total.
///
/// A total that was set to a non-numeric payload is left untouched.
pub(crate) fn accumulate_reward(total: Option<Payload>, reward: Option<f64>) -> Option<Payload> {
    match (total, reward) {
        (total, None) => total,
        (None, Some(r)) => Some(Payload::from(r)),
        (Some(total), Some(r)) => match total.as_f64() {
            Some(sum) => Some(Payload::from(sum + r)),
            None => Some(total),
        },
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), SimtreeError> {
    if name.trim().is_empty() {
        return Err(SimtreeError::InvalidInput("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(SimtreeError::InvalidInput(format!(
            "name exceeds {MAX_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn validate_description(description: Option<&str>) -> Result<(), SimtreeError> {
    match description {
        Some(text) if text.len() > MAX_DESCRIPTION_LENGTH => Err(SimtreeError::InvalidInput(
            format!("description exceeds {MAX_DESCRIPTION_LENGTH} bytes"),
        )),
        _ => Ok(()),
    }
}
