//! # Configuration Inheritance
//!
//! A run stores only its own overrides. Its effective configuration is
//! computed on demand:
//!
//! ```text
//! simulation.agent_config
//!   <- overrides of the origin run
//!   <- overrides of each branch, oldest first
//!   <- overrides of the run itself
//! ```
//!
//! Merging is shallow and last-writer-wins per key.

use crate::catalog::SimulationCatalog;
use crate::registry::RunRegistry;
use crate::repository::{ReadTxn, Repository};
use crate::types::{ConfigMap, Run, RunId, SimtreeError};
use std::collections::BTreeSet;

pub struct ConfigResolver;

impl ConfigResolver {
    /// Effective configuration of `run_id`.
    ///
    /// # Errors
    ///
    /// - `RunNotFound` if the run or an ancestor is missing
    /// - `SimulationNotFound` if the run's simulation is missing
    /// - `RunLineageCycle` if the parent-run chain loops
    pub fn effective_config<R: Repository>(
        repo: &R,
        run_id: RunId,
    ) -> Result<ConfigMap, SimtreeError> {
        repo.read(|txn| Self::effective_config_in(txn, run_id))
    }

    fn effective_config_in<T: ReadTxn + ?Sized>(
        txn: &T,
        run_id: RunId,
    ) -> Result<ConfigMap, SimtreeError> {
        let chain = Self::chain_in(txn, run_id)?;
        let Some(run) = chain.last() else {
            return Err(SimtreeError::RunNotFound(run_id));
        };
        let mut config = SimulationCatalog::require_in(txn, run.simulation_id)?.agent_config;
        for ancestor in &chain {
            config.extend(
                ancestor
                    .config_overrides
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        Ok(config)
    }

    /// The run and its ancestors, oldest first.
    pub fn inheritance_chain<R: Repository>(
        repo: &R,
        run_id: RunId,
    ) -> Result<Vec<Run>, SimtreeError> {
        repo.read(|txn| Self::chain_in(txn, run_id))
    }

    fn chain_in<T: ReadTxn + ?Sized>(txn: &T, run_id: RunId) -> Result<Vec<Run>, SimtreeError> {
        let mut visited = BTreeSet::new();
        let mut chain = Vec::new();
        let mut next = Some(run_id);
        while let Some(id) = next {
            if !visited.insert(id) {
                return Err(SimtreeError::RunLineageCycle(run_id));
            }
            let run = RunRegistry::require_in(txn, id)?;
            next = run.parent_run_id;
            chain.push(run);
        }
        chain.reverse();
        Ok(chain)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::branch::{BranchEngine, BranchRequest};
    use crate::nodes::StateStore;
    use crate::storage::MemoryStore;
    use crate::types::{NewRun, NewSimulation, NewState, Payload};
    use serde_json::json;

    fn config(pairs: &[(&str, serde_json::Value)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Payload::new(v.clone())))
            .collect()
    }

    #[test]
    fn overrides_apply_root_to_leaf() {
        let repo = MemoryStore::new();
        let sim = SimulationCatalog::create(
            &repo,
            NewSimulation::new("sim", "env", "agent")
                .with_agent_config(config(&[("lr", json!(0.1)), ("gamma", json!(0.9))])),
        )
        .expect("sim");
        let root = StateStore::create(&repo, NewState::root("s")).expect("root");

        let origin = RunRegistry::create_origin(
            &repo,
            NewRun::new(sim.id, "origin", root.id).with_overrides(config(&[("lr", json!(0.01))])),
        )
        .expect("origin");
        let child = BranchEngine::branch(
            &repo,
            BranchRequest::new(origin.id, root.id, "child")
                .with_overrides(config(&[("eps", json!(0.2))])),
        )
        .expect("child");
        let grandchild = BranchEngine::branch(
            &repo,
            BranchRequest::new(child.id, root.id, "grandchild")
                .with_overrides(config(&[("lr", json!(0.5)), ("net", json!({"layers": 2}))])),
        )
        .expect("grandchild");

        let effective = ConfigResolver::effective_config(&repo, grandchild.id).expect("config");
        assert_eq!(
            effective,
            config(&[
                ("eps", json!(0.2)),
                ("gamma", json!(0.9)),
                ("lr", json!(0.5)),
                ("net", json!({"layers": 2})),
            ])
        );

        let origin_cfg = ConfigResolver::effective_config(&repo, origin.id).expect("origin");
        assert_eq!(origin_cfg, config(&[("gamma", json!(0.9)), ("lr", json!(0.01))]));

        let chain: Vec<_> = ConfigResolver::inheritance_chain(&repo, grandchild.id)
            .expect("chain")
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(chain, vec![origin.id, child.id, grandchild.id]);
    }

    #[test]
    fn branch_stores_only_its_own_overrides() {
        let repo = MemoryStore::new();
        let sim = SimulationCatalog::create(&repo, NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = StateStore::create(&repo, NewState::root("s")).expect("root");
        let origin = RunRegistry::create_origin(
            &repo,
            NewRun::new(sim.id, "o", root.id).with_overrides(config(&[("a", json!(1))])),
        )
        .expect("origin");
        let branch = BranchEngine::branch(&repo, BranchRequest::new(origin.id, root.id, "b"))
            .expect("branch");
        assert!(branch.config_overrides.is_empty());
        assert_eq!(
            ConfigResolver::effective_config(&repo, branch.id).expect("cfg"),
            config(&[("a", json!(1))])
        );
    }

    #[test]
    fn parent_run_cycle_is_reported() {
        let repo = MemoryStore::new();
        let sim = SimulationCatalog::create(&repo, NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = StateStore::create(&repo, NewState::root("s")).expect("root");
        let a = RunRegistry::create_origin(&repo, NewRun::new(sim.id, "a", root.id)).expect("a");
        let b = BranchEngine::branch(&repo, BranchRequest::new(a.id, root.id, "b")).expect("b");

        repo.write(|txn| {
            let mut looped = txn.run(a.id)?.expect("a");
            looped.parent_run_id = Some(b.id);
            txn.put_run(&looped)
        })
        .expect("inject");

        assert!(matches!(
            ConfigResolver::effective_config(&repo, b.id),
            Err(SimtreeError::RunLineageCycle(_))
        ));
    }

    #[test]
    fn unknown_run() {
        let repo = MemoryStore::new();
        assert!(matches!(
            ConfigResolver::effective_config(&repo, RunId(1)),
            Err(SimtreeError::RunNotFound(RunId(1)))
        ));
    }
}
