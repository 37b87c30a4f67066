//! # Lineage Queries
//!
//! Read-only traversals over the state forest and the run tree:
//! - `path_to_root`, `depth`, `children`, `descendants` (states)
//! - `terminal_states` (filtered scan)
//! - `run_tree`, `compare_runs`, `runs_containing` (runs)
//!
//! Unbounded results (`descendants`, `terminal_states`) are lazy iterators
//! that read one page per transaction.

use crate::catalog::SimulationCatalog;
use crate::nodes::StateStore;
use crate::primitives::PAGE_SIZE;
use crate::registry::RunRegistry;
use crate::repository::{ReadTxn, Repository};
use crate::sequence::SequenceIndex;
use crate::types::{
    Run, RunId, SimtreeError, SimulationId, StateId, StateNode, TrajectoryEntry,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// =============================================================================
// RESULT TYPES
// =============================================================================

/// A run and the branches created from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunNode {
    pub run: Run,
    /// Ordered by `(created_at, id)`.
    pub children: Vec<RunNode>,
}

impl RunNode {
    /// Number of runs in this subtree, including this one.
    #[must_use]
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(RunNode::size).sum::<usize>()
    }
}

/// Side-by-side view of two trajectories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunComparison {
    pub left: RunId,
    pub right: RunId,
    /// Common prefix, in order.
    pub shared: Vec<StateNode>,
    pub left_only: Vec<StateNode>,
    pub right_only: Vec<StateNode>,
    /// Last shared state, if any.
    pub divergence_point: Option<StateNode>,
}

// =============================================================================
// QUERIES
// =============================================================================

pub struct Lineage;

impl Lineage {
    /// Ancestors of `id`, ordered root first and ending with `id` itself.
    ///
    /// # Errors
    ///
    /// - `StateNotFound` if `id` does not exist
    /// - `InvalidParent` if an ancestor is missing
    /// - `CycleDetected` if the chain is longer than the number of states
    pub fn path_to_root<R: Repository>(
        repo: &R,
        id: StateId,
    ) -> Result<Vec<StateNode>, SimtreeError> {
        repo.read(|txn| Self::path_in(txn, id))
    }

    fn path_in<T: ReadTxn + ?Sized>(txn: &T, id: StateId) -> Result<Vec<StateNode>, SimtreeError> {
        let bound = txn.state_count()?;
        let mut path = vec![StateStore::require_in(txn, id)?];
        while let Some(parent) = path.last().and_then(|node| node.parent_id) {
            if path.len() as u64 >= bound {
                return Err(SimtreeError::CycleDetected(id));
            }
            let node = txn.state(parent)?.ok_or(SimtreeError::InvalidParent(parent))?;
            path.push(node);
        }
        path.reverse();
        Ok(path)
    }

    /// Number of ancestors of `id` (0 for a root).
    pub fn depth<R: Repository>(repo: &R, id: StateId) -> Result<u64, SimtreeError> {
        let path = Self::path_to_root(repo, id)?;
        Ok(path.len().saturating_sub(1) as u64)
    }

    /// Direct children of `id`, ordered by `(step_number, id)`.
    pub fn children<R: Repository>(repo: &R, id: StateId) -> Result<Vec<StateNode>, SimtreeError> {
        StateStore::children_of(repo, id)
    }

    /// Every state below `id` in breadth-first order, excluding `id`.
    pub fn descendants<R: Repository>(
        repo: &R,
        id: StateId,
    ) -> Result<Descendants<'_, R>, SimtreeError> {
        let frontier = repo.read(|txn| {
            StateStore::require_in(txn, id)?;
            txn.child_ids(id)
        })?;
        Ok(Descendants {
            repo,
            frontier: frontier.into_iter().collect(),
            seen: BTreeSet::from([id]),
            failed: false,
        })
    }

    /// Terminal (`done`) states accepted by `predicate`, ascending by id.
    pub fn terminal_states<R, F>(repo: &R, predicate: F) -> TerminalStates<'_, R, F>
    where
        R: Repository,
        F: FnMut(&StateNode) -> bool,
    {
        TerminalStates {
            repo,
            predicate,
            next_id: StateId(0),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Forest of runs for a simulation. Origin runs are the roots; each
    /// run's children are the branches whose `parent_run_id` names it.
    pub fn run_tree<R: Repository>(
        repo: &R,
        simulation: SimulationId,
    ) -> Result<Vec<RunNode>, SimtreeError> {
        repo.read(|txn| {
            SimulationCatalog::require_in(txn, simulation)?;
            let mut runs: BTreeMap<RunId, Run> = BTreeMap::new();
            for id in txn.run_ids_for_simulation(simulation)? {
                runs.insert(id, RunRegistry::require_in(txn, id)?);
            }

            let mut by_parent: BTreeMap<Option<RunId>, Vec<Run>> = BTreeMap::new();
            for run in runs.values() {
                // A parent outside this simulation is treated as absent.
                let parent = run.parent_run_id.filter(|p| runs.contains_key(p));
                by_parent.entry(parent).or_default().push(run.clone());
            }
            for siblings in by_parent.values_mut() {
                siblings.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
            }

            let roots = by_parent.remove(&None).unwrap_or_default();
            Ok(build_nodes(roots, &mut by_parent))
        })
    }

    /// Split two trajectories into their common prefix and the parts only
    /// one of them has.
    pub fn compare_runs<R: Repository>(
        repo: &R,
        left: RunId,
        right: RunId,
    ) -> Result<RunComparison, SimtreeError> {
        repo.read(|txn| {
            RunRegistry::require_in(txn, left)?;
            RunRegistry::require_in(txn, right)?;
            let left_entries = SequenceIndex::entries_in(txn, left)?;
            let right_entries = SequenceIndex::entries_in(txn, right)?;

            let common = left_entries
                .iter()
                .zip(&right_entries)
                .take_while(|(a, b)| a.state_id == b.state_id)
                .count();
            let load = |entries: &[TrajectoryEntry]| {
                entries
                    .iter()
                    .map(|e| StateStore::require_in(txn, e.state_id))
                    .collect::<Result<Vec<_>, _>>()
            };

            let shared = load(&left_entries[..common])?;
            Ok(RunComparison {
                left,
                right,
                divergence_point: shared.last().cloned(),
                left_only: load(&left_entries[common..])?,
                right_only: load(&right_entries[common..])?,
                shared,
            })
        })
    }

    /// Runs whose trajectory includes `state`, ascending by id.
    pub fn runs_containing<R: Repository>(
        repo: &R,
        state: StateId,
    ) -> Result<Vec<Run>, SimtreeError> {
        repo.read(|txn| {
            StateStore::require_in(txn, state)?;
            txn.runs_containing(state)?
                .into_iter()
                .map(|id| RunRegistry::require_in(txn, id))
                .collect()
        })
    }
}

fn build_nodes(runs: Vec<Run>, by_parent: &mut BTreeMap<Option<RunId>, Vec<Run>>) -> Vec<RunNode> {
    runs.into_iter()
        .map(|run| {
            let children = by_parent.remove(&Some(run.id)).unwrap_or_default();
            RunNode {
                children: build_nodes(children, by_parent),
                run,
            }
        })
        .collect()
}

// =============================================================================
// LAZY ITERATORS
// =============================================================================

/// Breadth-first walk below a state. See [`Lineage::descendants`].
pub struct Descendants<'r, R> {
    repo: &'r R,
    frontier: VecDeque<StateId>,
    seen: BTreeSet<StateId>,
    failed: bool,
}

impl<R> std::fmt::Debug for Descendants<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descendants")
            .field("frontier", &self.frontier.len())
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl<R: Repository> Iterator for Descendants<'_, R> {
    type Item = Result<StateNode, SimtreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let id = self.frontier.pop_front()?;
            // Guard against corrupted stores whose child index loops.
            if !self.seen.insert(id) {
                continue;
            }
            let step = self.repo.read(|txn| {
                let node = StateStore::require_in(txn, id)?;
                let children = txn.child_ids(id)?;
                Ok((node, children))
            });
            return match step {
                Ok((node, children)) => {
                    self.frontier.extend(children);
                    Some(Ok(node))
                }
                Err(err) => {
                    self.failed = true;
                    Some(Err(err))
                }
            };
        }
    }
}

/// Filtered scan over terminal states. See [`Lineage::terminal_states`].
pub struct TerminalStates<'r, R, F> {
    repo: &'r R,
    predicate: F,
    next_id: StateId,
    buffer: VecDeque<StateNode>,
    exhausted: bool,
}

impl<R, F> std::fmt::Debug for TerminalStates<'_, R, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalStates")
            .field("next_id", &self.next_id)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<R, F> Iterator for TerminalStates<'_, R, F>
where
    R: Repository,
    F: FnMut(&StateNode) -> bool,
{
    type Item = Result<StateNode, SimtreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.exhausted {
            let start = self.next_id;
            let page = match self.repo.read(|txn| txn.states_from(start, PAGE_SIZE)) {
                Ok(page) => page,
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            };
            match page.last() {
                Some(last) if page.len() == PAGE_SIZE => {
                    self.next_id = StateId(last.id.0.saturating_add(1));
                }
                _ => self.exhausted = true,
            }
            let predicate = &mut self.predicate;
            self.buffer.extend(
                page.into_iter()
                    .filter(|node| node.is_terminal() && predicate(node)),
            );
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::branch::{BranchEngine, BranchRequest};
    use crate::storage::MemoryStore;
    use crate::types::{NewRun, NewSimulation, NewState};

    struct Fixture {
        repo: MemoryStore,
        sim: SimulationId,
        root: StateNode,
    }

    fn fixture() -> Fixture {
        let repo = MemoryStore::new();
        let sim = SimulationCatalog::create(&repo, NewSimulation::new("sim", "env", "agent"))
            .expect("sim")
            .id;
        let root = StateStore::create(&repo, NewState::root("root")).expect("root");
        Fixture { repo, sim, root }
    }

    fn child(repo: &MemoryStore, parent: &StateNode) -> StateNode {
        StateStore::create(
            repo,
            NewState::child(parent.id, parent.step_number + 1, "s"),
        )
        .expect("child")
    }

    #[test]
    fn path_to_root_is_root_first() {
        let f = fixture();
        let a = child(&f.repo, &f.root);
        let b = child(&f.repo, &a);

        let path: Vec<_> = Lineage::path_to_root(&f.repo, b.id)
            .expect("path")
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(path, vec![f.root.id, a.id, b.id]);
        assert_eq!(Lineage::depth(&f.repo, b.id).expect("depth"), 2);
        assert_eq!(Lineage::depth(&f.repo, f.root.id).expect("depth"), 0);
    }

    #[test]
    fn path_to_root_of_unknown_state() {
        let f = fixture();
        assert!(matches!(
            Lineage::path_to_root(&f.repo, StateId(404)),
            Err(SimtreeError::StateNotFound(StateId(404)))
        ));
    }

    #[test]
    fn path_to_root_detects_cycles() {
        let f = fixture();
        let a = child(&f.repo, &f.root);
        f.repo
            .write(|txn| {
                let mut looped = txn.state(f.root.id)?.expect("root");
                looped.parent_id = Some(a.id);
                txn.put_state(&looped)
            })
            .expect("inject");
        assert!(matches!(
            Lineage::path_to_root(&f.repo, a.id),
            Err(SimtreeError::CycleDetected(_))
        ));
    }

    #[test]
    fn descendants_are_breadth_first_and_exclusive() {
        let f = fixture();
        let a = child(&f.repo, &f.root);
        let b = child(&f.repo, &f.root);
        let a1 = child(&f.repo, &a);
        let b1 = child(&f.repo, &b);

        let ids: Vec<_> = Lineage::descendants(&f.repo, f.root.id)
            .expect("walk")
            .map(|n| n.expect("node").id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id, a1.id, b1.id]);

        let leaf: Vec<_> = Lineage::descendants(&f.repo, b1.id).expect("leaf").collect();
        assert!(leaf.is_empty());
    }

    #[test]
    fn terminal_states_filtered() {
        let f = fixture();
        let win = StateStore::create(
            &f.repo,
            NewState::child(f.root.id, 1, "win").with_reward(10.0).done(),
        )
        .expect("win");
        let _loss = StateStore::create(
            &f.repo,
            NewState::child(f.root.id, 1, "loss").with_reward(-1.0).done(),
        )
        .expect("loss");
        let _open = child(&f.repo, &f.root);

        let all = Lineage::terminal_states(&f.repo, |_| true)
            .collect::<Result<Vec<_>, _>>()
            .expect("all");
        assert_eq!(all.len(), 2);

        let good: Vec<_> =
            Lineage::terminal_states(&f.repo, |s| s.reward.is_some_and(|r| r > 0.0))
                .map(|s| s.expect("state").id)
                .collect();
        assert_eq!(good, vec![win.id]);
    }

    #[test]
    fn run_tree_nests_branches() {
        let f = fixture();
        let a = child(&f.repo, &f.root);
        let origin = RunRegistry::create_origin(&f.repo, NewRun::new(f.sim, "origin", f.root.id))
            .expect("origin");
        SequenceIndex::append(&f.repo, origin.id, a.id).expect("append");

        let b1 = BranchEngine::branch(&f.repo, BranchRequest::new(origin.id, f.root.id, "b1"))
            .expect("b1");
        let b2 = BranchEngine::branch(&f.repo, BranchRequest::new(origin.id, a.id, "b2"))
            .expect("b2");
        let b1a = BranchEngine::branch(&f.repo, BranchRequest::new(b1.id, f.root.id, "b1a"))
            .expect("b1a");
        let other =
            RunRegistry::create_origin(&f.repo, NewRun::new(f.sim, "second", f.root.id))
                .expect("second");

        let tree = Lineage::run_tree(&f.repo, f.sim).expect("tree");
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].run.id, origin.id);
        assert_eq!(tree[1].run.id, other.id);
        assert_eq!(tree[0].size(), 4);

        let children: Vec<_> = tree[0].children.iter().map(|n| n.run.id).collect();
        assert_eq!(children, vec![b1.id, b2.id]);
        assert_eq!(tree[0].children[0].children[0].run.id, b1a.id);
    }

    #[test]
    fn compare_runs_finds_divergence() {
        let f = fixture();
        let a = child(&f.repo, &f.root);
        let b = child(&f.repo, &a);
        let origin = RunRegistry::create_origin(&f.repo, NewRun::new(f.sim, "o", f.root.id))
            .expect("origin");
        SequenceIndex::append(&f.repo, origin.id, a.id).expect("a");
        SequenceIndex::append(&f.repo, origin.id, b.id).expect("b");

        let branch = BranchEngine::branch(&f.repo, BranchRequest::new(origin.id, a.id, "alt"))
            .expect("branch");
        let c = child(&f.repo, &a);
        SequenceIndex::append(&f.repo, branch.id, c.id).expect("c");

        let cmp = Lineage::compare_runs(&f.repo, origin.id, branch.id).expect("compare");
        let ids = |nodes: &[StateNode]| nodes.iter().map(|n| n.id).collect::<Vec<_>>();
        assert_eq!(ids(&cmp.shared), vec![f.root.id, a.id]);
        assert_eq!(ids(&cmp.left_only), vec![b.id]);
        assert_eq!(ids(&cmp.right_only), vec![c.id]);
        assert_eq!(cmp.divergence_point.map(|n| n.id), Some(a.id));
    }

    #[test]
    fn runs_containing_shared_state() {
        let f = fixture();
        let origin = RunRegistry::create_origin(&f.repo, NewRun::new(f.sim, "o", f.root.id))
            .expect("origin");
        let branch =
            BranchEngine::branch(&f.repo, BranchRequest::new(origin.id, f.root.id, "alt"))
                .expect("branch");
        let ids: Vec<_> = Lineage::runs_containing(&f.repo, f.root.id)
            .expect("runs")
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![origin.id, branch.id]);
    }
}
