//! # Scenario Tests
//!
//! End-to-end behaviour of the history store on both backends.
//!
//! ## Groups
//! - Trajectories: ordering and duplicate guards
//! - Branching: copy-on-branch isolation and shared children
//! - Runs: status machine and config inheritance
//! - Concurrency: serialized appends within a run, parallel across runs

use serde_json::json;
use simtree_core::{
    BranchRequest, ConfigMap, History, NewRun, NewSimulation, NewState, Payload, Repository,
    RunId, RunStatus, SimtreeError, StateId, StateNode,
};
use std::collections::BTreeSet;

fn config(pairs: &[(&str, serde_json::Value)]) -> ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), Payload::new(v.clone())))
        .collect()
}

fn ids(nodes: &[StateNode]) -> Vec<StateId> {
    nodes.iter().map(|n| n.id).collect()
}

/// Run A with trajectory [s0, s1, s2, s3].
struct Fixture {
    run: RunId,
    states: Vec<StateId>,
}

fn linear_run<R: Repository>(history: &History<R>) -> Fixture {
    let sim = history
        .create_simulation(NewSimulation::new("cartpole", "CartPole-v1", "ppo"))
        .expect("sim");
    let s0 = history.create_state(NewState::root(json!({"x": 0}))).expect("s0");
    let run = history
        .create_run(NewRun::new(sim.id, "A", s0.id))
        .expect("run");
    let mut states = vec![s0.id];
    for step in 1..=3u64 {
        let parent = *states.last().expect("parent");
        let (node, order) = history
            .record_state(
                run.id,
                NewState::child(parent, step, json!({"x": step})).with_reward(1.0),
            )
            .expect("record");
        assert_eq!(order, step);
        states.push(node.id);
    }
    Fixture {
        run: run.id,
        states,
    }
}

// =============================================================================
// TRAJECTORIES
// =============================================================================

mod trajectories {
    use super::*;

    /// Every parent chain ends at a root within node-count steps.
    #[test]
    fn lineage_terminates_at_root() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let lineage = history.get_lineage(f.states[3]).expect("lineage");
        assert_eq!(ids(&lineage), f.states);
        assert!(lineage[0].is_root());
        assert!(history.verify().expect("verify").is_clean());
    }

    /// Orders are strictly increasing and gap-free.
    #[test]
    fn orders_are_contiguous() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let orders: Vec<u64> = history
            .trajectory_entries(f.run)
            .expect("entries")
            .iter()
            .map(|e| e.sequence_order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    /// A second append of the same state fails and changes nothing.
    #[test]
    fn duplicate_append_is_rejected() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let before = history.get_trajectory(f.run).expect("before");

        let err = history
            .append_state(f.run, f.states[2])
            .expect_err("duplicate");
        assert!(matches!(err, SimtreeError::DuplicateState { .. }));
        assert_eq!(history.get_trajectory(f.run).expect("after"), before);
        assert_eq!(history.get_run(f.run).expect("run").total_steps, 3);
    }

    /// Rewards accumulate into the run total.
    #[test]
    fn rewards_accumulate() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let run = history.get_run(f.run).expect("run");
        assert_eq!(run.total_reward.and_then(|r| r.as_f64()), Some(3.0));
        assert_eq!(run.current_state_id, f.states[3]);
    }
}

// =============================================================================
// BRANCHING
// =============================================================================

mod branching {
    use super::*;

    /// Branch at s1 sees [s0, s1]; appending to it leaves A untouched.
    #[test]
    fn branch_is_isolated_from_parent() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let s1 = f.states[1];

        let b = history
            .branch(BranchRequest::new(f.run, s1, "B"))
            .expect("branch");
        assert_eq!(b.root_state_id, s1);
        assert_eq!(b.branch_point_state_id, Some(s1));
        assert_eq!(b.parent_run_id, Some(f.run));
        assert_eq!(
            ids(&history.get_trajectory(b.id).expect("b")),
            vec![f.states[0], s1]
        );

        let (s4, order) = history
            .record_state(b.id, NewState::child(s1, 2, json!({"x": "alt"})))
            .expect("s4'");
        assert_eq!(order, 2);

        assert_eq!(ids(&history.get_trajectory(f.run).expect("a")), f.states);
        assert_eq!(
            ids(&history.get_trajectory(b.id).expect("b")),
            vec![f.states[0], s1, s4.id]
        );

        let children: BTreeSet<StateId> =
            ids(&history.get_children(s1).expect("children")).into_iter().collect();
        assert_eq!(children, BTreeSet::from([f.states[2], s4.id]));
    }

    /// A branch point outside the parent's trajectory leaves no run behind.
    #[test]
    fn invalid_branch_point_creates_nothing() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let stray = history.create_state(NewState::root("stray")).expect("stray");
        let before = history.stats().expect("stats");

        let err = history
            .branch(BranchRequest::new(f.run, stray.id, "B"))
            .expect_err("not in run");
        assert!(matches!(err, SimtreeError::InvalidBranchPoint { .. }));
        assert_eq!(history.stats().expect("stats"), before);
    }

    /// The run tree nests branches under their parents.
    #[test]
    fn run_tree_nests_branches() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let b = history
            .branch(BranchRequest::new(f.run, f.states[1], "B"))
            .expect("B");
        let c = history
            .branch(BranchRequest::new(b.id, f.states[0], "C"))
            .expect("C");
        let d = history
            .branch(BranchRequest::new(f.run, f.states[3], "D"))
            .expect("D");

        let sim = history.get_run(f.run).expect("run").simulation_id;
        let tree = history.get_run_tree(sim).expect("tree");
        assert_eq!(tree.len(), 1);
        let root = &tree[0];
        assert_eq!(root.run.id, f.run);
        assert_eq!(root.size(), 4);
        let child_ids: Vec<RunId> = root.children.iter().map(|n| n.run.id).collect();
        assert_eq!(child_ids, vec![b.id, d.id]);
        assert_eq!(root.children[0].children[0].run.id, c.id);
    }

    /// Runs sharing a prefix diverge after the branch point.
    #[test]
    fn compare_runs_reports_divergence() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let b = history
            .branch(BranchRequest::new(f.run, f.states[1], "B"))
            .expect("B");
        let (alt, _) = history
            .record_state(b.id, NewState::child(f.states[1], 2, "alt"))
            .expect("alt");

        let cmp = history.compare_runs(f.run, b.id).expect("compare");
        assert_eq!(ids(&cmp.shared), f.states[..2].to_vec());
        assert_eq!(ids(&cmp.left_only), f.states[2..].to_vec());
        assert_eq!(ids(&cmp.right_only), vec![alt.id]);
        assert_eq!(cmp.divergence_point.map(|n| n.id), Some(f.states[1]));
    }
}

// =============================================================================
// RUNS
// =============================================================================

mod runs {
    use super::*;

    /// New runs are active; completed runs cannot be reactivated.
    #[test]
    fn completed_run_cannot_resume() {
        let history = History::in_memory();
        let f = linear_run(&history);
        assert_eq!(history.get_run(f.run).expect("run").status, RunStatus::Active);

        let done = history
            .transition_run(f.run, RunStatus::Completed)
            .expect("complete");
        assert!(done.completed_at.is_some());

        let err = history
            .transition_run(f.run, RunStatus::Active)
            .expect_err("terminal");
        assert!(matches!(err, SimtreeError::IllegalStatusTransition { .. }));
    }

    /// Branch overrides layer over the simulation's agent config.
    #[test]
    fn config_inherits_through_branches() {
        let history = History::in_memory();
        let sim = history
            .create_simulation(
                NewSimulation::new("sim", "env", "dqn")
                    .with_agent_config(config(&[("lr", json!(0.001)), ("gamma", json!(0.99))])),
            )
            .expect("sim");
        let root = history.create_state(NewState::root("s0")).expect("root");
        let a = history
            .create_run(NewRun::new(sim.id, "A", root.id))
            .expect("A");
        let b = history
            .branch(
                BranchRequest::new(a.id, root.id, "B")
                    .with_overrides(config(&[("lr", json!(0.01))])),
            )
            .expect("B");

        assert_eq!(
            history.effective_config(b.id).expect("config"),
            config(&[("gamma", json!(0.99)), ("lr", json!(0.01))])
        );
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

mod concurrency {
    use super::*;

    const WRITERS: usize = 8;
    const PER_WRITER: u64 = 10;

    fn assert_contiguous<R: Repository>(history: &History<R>, run: RunId, len: usize) {
        let orders: Vec<u64> = history
            .trajectory_entries(run)
            .expect("entries")
            .iter()
            .map(|e| e.sequence_order)
            .collect();
        assert_eq!(orders, (0..len as u64).collect::<Vec<_>>());
    }

    fn same_run_appends<R: Repository>(history: &History<R>) {
        let sim = history
            .create_simulation(NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = history.create_state(NewState::root("root")).expect("root");
        let run = history
            .create_run(NewRun::new(sim.id, "shared", root.id))
            .expect("run");

        std::thread::scope(|scope| {
            for writer in 0..WRITERS {
                scope.spawn(move || {
                    for step in 0..PER_WRITER {
                        history
                            .record_state(
                                run.id,
                                NewState::child(root.id, 1, json!({"w": writer, "s": step})),
                            )
                            .expect("record");
                    }
                });
            }
        });

        let expected = 1 + WRITERS * PER_WRITER as usize;
        assert_contiguous(history, run.id, expected);
        assert_eq!(
            history.get_run(run.id).expect("run").total_steps,
            (WRITERS as u64) * PER_WRITER
        );
    }

    fn distinct_run_appends<R: Repository>(history: &History<R>) {
        let sim = history
            .create_simulation(NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let runs: Vec<(RunId, StateId)> = (0..WRITERS)
            .map(|i| {
                let root = history.create_state(NewState::root(json!(i))).expect("root");
                let run = history
                    .create_run(NewRun::new(sim.id, format!("run-{i}"), root.id))
                    .expect("run");
                (run.id, root.id)
            })
            .collect();

        std::thread::scope(|scope| {
            for &(run, root) in &runs {
                scope.spawn(move || {
                    let mut parent = root;
                    for step in 1..=PER_WRITER {
                        let (node, order) = history
                            .record_state(run, NewState::child(parent, step, json!(step)))
                            .expect("record");
                        assert_eq!(order, step);
                        parent = node.id;
                    }
                });
            }
        });

        for (run, _) in runs {
            assert_contiguous(history, run, 1 + PER_WRITER as usize);
        }
    }

    #[test]
    fn same_run_appends_never_share_an_order_in_memory() {
        same_run_appends(&History::in_memory());
    }

    #[test]
    fn distinct_runs_append_independently_in_memory() {
        distinct_run_appends(&History::in_memory());
    }

    #[test]
    fn same_run_appends_never_share_an_order_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = History::open(dir.path().join("history.redb")).expect("open");
        same_run_appends(&history);
    }

    #[test]
    fn distinct_runs_append_independently_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = History::open(dir.path().join("history.redb")).expect("open");
        distinct_run_appends(&history);
    }

    /// Concurrent branches from one parent each see their own prefix.
    #[test]
    fn concurrent_branches_from_one_parent() {
        let history = History::in_memory();
        let f = linear_run(&history);
        let points = f.states.clone();

        let branches: Vec<RunId> = std::thread::scope(|scope| {
            let handles: Vec<_> = points
                .iter()
                .enumerate()
                .map(|(i, &point)| {
                    let history = &history;
                    scope.spawn(move || {
                        history
                            .branch(BranchRequest::new(f.run, point, format!("b{i}")))
                            .expect("branch")
                            .id
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("join"))
                .collect()
        });

        for (i, branch) in branches.into_iter().enumerate() {
            assert_eq!(
                ids(&history.get_trajectory(branch).expect("trajectory")),
                f.states[..=i].to_vec()
            );
        }
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// A redb history survives reopening and round-trips through a snapshot.
#[test]
fn redb_history_persists_and_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history.redb");

    let (run, states) = {
        let history = History::open(&path).expect("open");
        let f = linear_run(&history);
        history
            .branch(BranchRequest::new(f.run, f.states[2], "B"))
            .expect("branch");
        (f.run, f.states)
    };

    let reopened = History::open(&path).expect("reopen");
    assert_eq!(ids(&reopened.get_trajectory(run).expect("trajectory")), states);

    let snapshot = reopened.snapshot().expect("snapshot");
    let bytes = snapshot.to_bytes().expect("encode");
    let decoded = simtree_core::Snapshot::from_bytes(&bytes).expect("decode");

    let copy = History::in_memory();
    copy.restore(&decoded).expect("restore");
    assert_eq!(copy.stats().expect("stats"), reopened.stats().expect("stats"));
    assert_eq!(ids(&copy.get_trajectory(run).expect("trajectory")), states);

    let next = copy.create_state(NewState::root("fresh")).expect("fresh");
    assert!(states.iter().all(|id| *id < next.id));
}
