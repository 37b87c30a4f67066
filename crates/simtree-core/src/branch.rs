//! # Branch Engine
//!
//! Creates a new run that shares history with a parent run up to a chosen
//! state and then diverges.
//!
//! A branch gets its own copy of the parent's trajectory prefix, so the
//! two runs can be appended to independently afterwards. The whole branch
//! (run record, copied entries, counters) is one transaction.

use crate::nodes::StateStore;
use crate::registry::{RunRegistry, accumulate_reward, validate_description, validate_name};
use crate::repository::{IdKind, Repository, WriteTxn};
use crate::sequence::SequenceIndex;
use crate::types::{ConfigMap, Payload, Run, RunId, RunStatus, SimtreeError, StateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameters for [`BranchEngine::branch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRequest {
    pub parent_run_id: RunId,
    pub branch_point_state_id: StateId,
    pub name: String,
    /// Overrides layered on top of everything the parent inherits.
    #[serde(default)]
    pub config_overrides: ConfigMap,
    /// Defaults to "Branched from {parent} at step {n}".
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Payload>,
}

impl BranchRequest {
    #[must_use]
    pub fn new(parent_run_id: RunId, branch_point_state_id: StateId, name: impl Into<String>) -> Self {
        Self {
            parent_run_id,
            branch_point_state_id,
            name: name.into(),
            config_overrides: ConfigMap::new(),
            description: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigMap) -> Self {
        self.config_overrides = overrides;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub struct BranchEngine;

impl BranchEngine {
    /// Fork `parent_run_id` at `branch_point_state_id`.
    ///
    /// The new run is active, rooted at the branch point, and its
    /// trajectory is a copy of the parent's up to and including the branch
    /// point. The parent may have any status.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` if the parent does not exist
    /// - `InvalidBranchPoint` if the state is not in the parent's trajectory
    /// - `InvalidInput` for a bad name
    ///
    /// On error nothing is written.
    pub fn branch<R: Repository>(repo: &R, request: BranchRequest) -> Result<Run, SimtreeError> {
        let parent_run_id = request.parent_run_id;
        let run = repo.write(|txn| Self::branch_in(txn, request, Utc::now()))?;
        tracing::info!(
            run_id = %run.id,
            parent_run_id = %parent_run_id,
            branch_point = %run.root_state_id,
            copied = run.total_steps,
            "run branched"
        );
        Ok(run)
    }

    fn branch_in<T: WriteTxn + ?Sized>(
        txn: &mut T,
        request: BranchRequest,
        now: DateTime<Utc>,
    ) -> Result<Run, SimtreeError> {
        validate_name(&request.name)?;
        validate_description(request.description.as_deref())?;

        let parent = RunRegistry::require_in(&*txn, request.parent_run_id)?;
        let point = request.branch_point_state_id;
        if txn.position_of(parent.id, point)?.is_none() {
            return Err(SimtreeError::InvalidBranchPoint {
                run: parent.id,
                state: point,
            });
        }
        let point_state = StateStore::require_in(&*txn, point)?;

        let description = request.description.unwrap_or_else(|| {
            format!(
                "Branched from {} at step {}",
                parent.name, point_state.step_number
            )
        });
        let mut run = Run {
            id: RunId(txn.allocate_id(IdKind::Run)?),
            simulation_id: parent.simulation_id,
            name: request.name,
            description: Some(description),
            root_state_id: point,
            current_state_id: point,
            parent_run_id: Some(parent.id),
            branch_point_state_id: Some(point),
            config_overrides: request.config_overrides,
            status: RunStatus::Active,
            total_steps: 0,
            total_reward: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            metadata: request.metadata,
        };
        txn.put_run(&run)?;

        let copied = SequenceIndex::copy_prefix_in(txn, parent.id, run.id, point, now)?;
        let mut reward = None;
        for state_id in &copied {
            reward = accumulate_reward(reward, StateStore::require_in(&*txn, *state_id)?.reward);
        }
        run.total_steps = copied.len() as u64;
        run.total_reward = reward;
        txn.put_run(&run)?;
        Ok(run)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::catalog::SimulationCatalog;
    use crate::storage::MemoryStore;
    use crate::types::{NewRun, NewSimulation, NewState, RunFilter, StateNode};

    /// Origin run with states s0..s3 (rewards 1.0 each after the root).
    fn chain(repo: &MemoryStore) -> (Run, Vec<StateNode>) {
        let sim = SimulationCatalog::create(repo, NewSimulation::new("sim", "grid", "agent"))
            .expect("sim");
        let root = StateStore::create(repo, NewState::root("s0")).expect("root");
        let run =
            RunRegistry::create_origin(repo, NewRun::new(sim.id, "main", root.id)).expect("run");
        let mut states = vec![root];
        for step in 1..=3 {
            let parent = states[states.len() - 1].id;
            let s = StateStore::create(repo, NewState::child(parent, step, "s").with_reward(1.0))
                .expect("state");
            SequenceIndex::append(repo, run.id, s.id).expect("append");
            states.push(s);
        }
        (RunRegistry::get(repo, run.id).expect("run"), states)
    }

    #[test]
    fn branch_copies_prefix_through_branch_point() {
        let repo = MemoryStore::new();
        let (parent, states) = chain(&repo);

        let branch =
            BranchEngine::branch(&repo, BranchRequest::new(parent.id, states[2].id, "alt"))
                .expect("branch");

        assert_eq!(branch.parent_run_id, Some(parent.id));
        assert_eq!(branch.branch_point_state_id, Some(states[2].id));
        assert_eq!(branch.root_state_id, states[2].id);
        assert_eq!(branch.current_state_id, states[2].id);
        assert_eq!(branch.status, RunStatus::Active);
        assert_eq!(branch.simulation_id, parent.simulation_id);
        assert_eq!(branch.total_steps, 3);
        assert_eq!(branch.total_reward.as_ref().and_then(|r| r.as_f64()), Some(2.0));
        assert_eq!(
            branch.description.as_deref(),
            Some("Branched from main at step 2")
        );

        let copied: Vec<_> = SequenceIndex::entries(&repo, branch.id)
            .expect("entries")
            .iter()
            .map(|e| (e.sequence_order, e.state_id))
            .collect();
        assert_eq!(
            copied,
            vec![(0, states[0].id), (1, states[1].id), (2, states[2].id)]
        );
    }

    #[test]
    fn branch_at_root_has_single_entry() {
        let repo = MemoryStore::new();
        let (parent, states) = chain(&repo);
        let branch =
            BranchEngine::branch(&repo, BranchRequest::new(parent.id, states[0].id, "root-fork"))
                .expect("branch");
        assert_eq!(branch.total_steps, 1);
        assert_eq!(SequenceIndex::entries(&repo, branch.id).expect("e").len(), 1);
    }

    #[test]
    fn parent_is_untouched_by_branch_appends() {
        let repo = MemoryStore::new();
        let (parent, states) = chain(&repo);
        let before = SequenceIndex::entries(&repo, parent.id).expect("before");

        let branch =
            BranchEngine::branch(&repo, BranchRequest::new(parent.id, states[1].id, "alt"))
                .expect("branch");
        let fresh = StateStore::create(&repo, NewState::child(states[1].id, 2, "x")).expect("x");
        SequenceIndex::append(&repo, branch.id, fresh.id).expect("append");

        assert_eq!(SequenceIndex::entries(&repo, parent.id).expect("after"), before);
        assert_eq!(RunRegistry::get(&repo, parent.id).expect("parent"), parent);
    }

    #[test]
    fn branch_point_outside_parent_is_rejected_atomically() {
        let repo = MemoryStore::new();
        let (parent, _) = chain(&repo);
        let stray = StateStore::create(&repo, NewState::root("stray")).expect("stray");

        let err = BranchEngine::branch(&repo, BranchRequest::new(parent.id, stray.id, "bad"))
            .expect_err("invalid");
        assert!(matches!(err, SimtreeError::InvalidBranchPoint { .. }));
        assert_eq!(
            RunRegistry::list(&repo, RunFilter::default()).expect("runs").len(),
            1
        );
    }

    #[test]
    fn branch_from_completed_parent_is_allowed() {
        let repo = MemoryStore::new();
        let (parent, states) = chain(&repo);
        RunRegistry::complete(&repo, parent.id, None).expect("complete");
        let branch =
            BranchEngine::branch(&repo, BranchRequest::new(parent.id, states[3].id, "retry"))
                .expect("branch");
        assert_eq!(branch.status, RunStatus::Active);
    }

    #[test]
    fn branch_of_unknown_run() {
        let repo = MemoryStore::new();
        assert!(matches!(
            BranchEngine::branch(&repo, BranchRequest::new(RunId(8), StateId(1), "x")),
            Err(SimtreeError::RunNotFound(RunId(8)))
        ));
    }
}
