//! # CLI Command Implementations
//!
//! Every command opens the configured store, performs one or more core
//! calls, and prints either a human summary or JSON (`--json-mode`).
//! With the `file` backend, mutating commands write the snapshot file
//! back before returning.

use super::{RunCommand, SimulationCommand, SnapshotFormat, StateCommand};
use crate::api::{self, AppState};
use crate::error::AppError;
use crate::settings::{Backend, Settings};
use serde::Serialize;
use simtree_core::{
    BranchRequest, ConfigMap, History, NewRun, NewSimulation, NewState, Payload, Run, RunFilter,
    RunId, RunNode, SimulationId, Snapshot, StateId, StateNode,
    primitives::{MAGIC_BYTES, MAX_SNAPSHOT_SIZE},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// FILE HELPERS
// =============================================================================

/// Reject files larger than `max_size` before reading them.
fn validate_file_size(path: &Path, max_size: usize) -> Result<(), AppError> {
    let metadata = std::fs::metadata(path)
        .map_err(AppError::io(format!("Cannot read metadata of {}", path.display())))?;

    if metadata.len() > max_size as u64 {
        return Err(AppError::Usage(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and require a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, AppError> {
    let canonical = path
        .canonicalize()
        .map_err(AppError::io(format!("Invalid file path '{}'", path.display())))?;

    if !canonical.is_file() {
        return Err(AppError::Usage(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    Ok(canonical)
}

/// Canonicalize the parent directory of an output path.
fn validate_output_path(path: &Path) -> Result<PathBuf, AppError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let canonical_parent = parent.canonicalize().map_err(AppError::io(format!(
        "Invalid output directory '{}'",
        parent.display()
    )))?;

    if !canonical_parent.is_dir() {
        return Err(AppError::Usage(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| AppError::Usage("Output path has no filename".to_string()))?;
    Ok(canonical_parent.join(filename))
}

/// Read a snapshot file, binary or JSON.
pub fn read_snapshot(path: &Path) -> Result<Snapshot, AppError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_SNAPSHOT_SIZE)?;
    let data = std::fs::read(&validated)
        .map_err(AppError::io(format!("Read {}", validated.display())))?;

    if data.starts_with(MAGIC_BYTES) {
        return Ok(Snapshot::from_bytes(&data)?);
    }
    let text = std::str::from_utf8(&data)
        .map_err(|_| AppError::Usage("Snapshot is neither binary nor JSON".to_string()))?;
    Ok(Snapshot::from_json(text)?)
}

// =============================================================================
// STORE HELPERS
// =============================================================================

/// Open the store named by `settings`.
///
/// The `file` backend starts empty when the file does not exist yet.
pub fn open_history(settings: &Settings) -> Result<History, AppError> {
    let path = &settings.storage.path;
    match settings.storage.backend {
        Backend::Redb => Ok(History::open(path)?),
        Backend::File => {
            let history = History::in_memory();
            if path.exists() {
                history.restore(&read_snapshot(path)?)?;
            }
            Ok(history)
        }
    }
}

/// Persist `history` for the `file` backend; redb has already committed.
pub fn save_history(history: &History, settings: &Settings) -> Result<(), AppError> {
    if history.repository().is_persistent() {
        return Ok(());
    }
    let bytes = history.snapshot()?.to_bytes()?;
    let path = &settings.storage.path;
    std::fs::write(path, &bytes).map_err(AppError::io(format!("Write {}", path.display())))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "snapshot file written");
    Ok(())
}

/// Parse a CLI payload: JSON if it parses, otherwise the raw text.
fn parse_payload(text: &str) -> Payload {
    serde_json::from_str::<serde_json::Value>(text)
        .map(Payload::new)
        .unwrap_or_else(|_| Payload::from(text))
}

/// Parse a JSON object of config values.
fn parse_config(text: Option<&str>) -> Result<ConfigMap, AppError> {
    match text {
        None => Ok(ConfigMap::new()),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| AppError::Usage(format!("Config must be a JSON object: {}", e))),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Usage(format!("Cannot encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn print_state(node: &StateNode) {
    let parent = node
        .parent_id
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    let reward = node
        .reward
        .map_or_else(|| "-".to_string(), |r| r.to_string());
    let flag = if node.done {
        " [done]"
    } else if node.truncated {
        " [truncated]"
    } else {
        ""
    };
    println!(
        "  state {:>6}  parent {:>6}  step {:>5}  reward {:>8}{}  obs {}",
        node.id, parent, node.step_number, reward, flag, node.observation
    );
}

fn print_states(nodes: &[StateNode]) {
    for node in nodes {
        print_state(node);
    }
    println!("{} state(s)", nodes.len());
}

fn print_run(run: &Run) {
    let parent = run
        .parent_run_id
        .map_or_else(String::new, |p| format!("  branch of {} at {}", p, run.root_state_id));
    println!(
        "  run {:>5}  {:<10} {:<24} steps {:>6}  current {}{}",
        run.id,
        run.status.as_str(),
        run.name,
        run.total_steps,
        run.current_state_id,
        parent
    );
}

fn print_tree(nodes: &[RunNode], depth: usize) {
    for node in nodes {
        println!(
            "{}- {} (run {}, {}, {} steps)",
            "  ".repeat(depth),
            node.run.name,
            node.run.id,
            node.run.status,
            node.run.total_steps
        );
        print_tree(&node.children, depth + 1);
    }
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Start the HTTP server.
pub async fn cmd_server(settings: &Settings) -> Result<(), AppError> {
    let history = Arc::new(open_history(settings)?);
    let server = &settings.server;

    println!("Simtree Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", server.host);
    println!("  Port:     {}", server.port);
    println!("  Backend:  {}", settings.storage.backend.as_str());
    println!("  Database: {}", settings.storage.path.display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let mut state = AppState::shared(Arc::clone(&history));
    if !history.repository().is_persistent() {
        state = state.with_snapshot_file(settings.storage.path.clone());
    }

    let addr = format!("{}:{}", server.host, server.port);
    api::run_server(&addr, state, server, shutdown_signal()).await?;

    save_history(&history, settings)
}

// =============================================================================
// STORE COMMANDS
// =============================================================================

/// Initialize a new database.
pub fn cmd_init(settings: &Settings, force: bool) -> Result<(), AppError> {
    let path = &settings.storage.path;
    if path.exists() {
        if !force {
            return Err(AppError::Usage(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(path).map_err(AppError::io(format!("Remove {}", path.display())))?;
    }

    let history = open_history(settings)?;
    save_history(&history, settings)?;
    println!(
        "Initialized new {} database at {}",
        settings.storage.backend.as_str(),
        path.display()
    );
    Ok(())
}

/// Show store counts.
pub fn cmd_status(settings: &Settings, json_mode: bool) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let stats = history.stats()?;

    if json_mode {
        return print_json(&serde_json::json!({
            "database": settings.storage.path.to_string_lossy(),
            "backend": settings.storage.backend.as_str(),
            "simulations": stats.simulations,
            "states": stats.states,
            "runs": stats.runs,
            "active_runs": stats.active_runs,
            "branches": stats.branches,
        }));
    }

    println!("Simtree Status");
    println!("==============");
    println!("Database: {}", settings.storage.path.display());
    println!("Backend:  {}", settings.storage.backend.as_str());
    println!();
    println!("Simulations: {}", stats.simulations);
    println!("States:      {}", stats.states);
    println!("Runs:        {}", stats.runs);
    println!("  active:    {}", stats.active_runs);
    println!("  branches:  {}", stats.branches);
    Ok(())
}

/// Check the state tree.
pub fn cmd_verify(settings: &Settings, json_mode: bool) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let report = history.verify()?;

    if json_mode {
        return print_json(&report);
    }
    println!("Checked {} state(s): no cycles", report.states_checked);
    if report.is_clean() {
        println!("No orphaned states");
    } else {
        let ids: Vec<String> = report.orphans.iter().map(ToString::to_string).collect();
        println!("Orphaned states: {}", ids.join(", "));
    }
    Ok(())
}

/// Compact the redb database file.
pub fn cmd_compact(settings: &Settings) -> Result<(), AppError> {
    if settings.storage.backend != Backend::Redb {
        return Err(AppError::Usage(
            "Compaction only applies to the redb backend".to_string(),
        ));
    }
    let mut history = open_history(settings)?;
    if history.compact()? {
        println!("Compacted {}", settings.storage.path.display());
    } else {
        println!("{} is already compact", settings.storage.path.display());
    }
    Ok(())
}

// =============================================================================
// SIMULATION / STATE / RUN COMMANDS
// =============================================================================

pub fn cmd_simulation(
    settings: &Settings,
    json_mode: bool,
    action: SimulationCommand,
) -> Result<(), AppError> {
    let history = open_history(settings)?;

    match action {
        SimulationCommand::Create {
            name,
            env,
            agent,
            agent_config,
            env_config,
            description,
            max_steps,
            seed,
            tags,
        } => {
            let mut new = NewSimulation::new(name, env, agent)
                .with_agent_config(parse_config(agent_config.as_deref())?)
                .with_environment_config(parse_config(env_config.as_deref())?)
                .with_tags(tags);
            if let Some(description) = description {
                new = new.with_description(description);
            }
            if let Some(max_steps) = max_steps {
                new = new.with_max_steps(max_steps);
            }
            if let Some(seed) = seed {
                new = new.with_seed(seed);
            }

            let sim = history.create_simulation(new)?;
            save_history(&history, settings)?;
            if json_mode {
                return print_json(&sim);
            }
            println!("Created simulation {} ({})", sim.id, sim.name);
        }
        SimulationCommand::List => {
            let sims = history.list_simulations()?;
            if json_mode {
                return print_json(&sims);
            }
            for sim in &sims {
                println!(
                    "  simulation {:>4}  {:<24} env {:<20} agent {}",
                    sim.id, sim.name, sim.environment_name, sim.agent_type
                );
            }
            println!("{} simulation(s)", sims.len());
        }
    }
    Ok(())
}

pub fn cmd_state(
    settings: &Settings,
    json_mode: bool,
    action: StateCommand,
) -> Result<(), AppError> {
    let history = open_history(settings)?;

    match action {
        StateCommand::Create {
            parent,
            step,
            observation,
            action,
            reward,
            done,
            truncated,
            info,
            metadata,
            run,
        } => {
            let observation = parse_payload(&observation);
            let mut new = match parent {
                Some(parent) => NewState::child(StateId(parent), step, observation),
                None => NewState {
                    step_number: step,
                    ..NewState::root(observation)
                },
            };
            if let Some(action) = action.as_deref() {
                new = new.with_action(parse_payload(action));
            }
            if let Some(reward) = reward {
                new = new.with_reward(reward);
            }
            if let Some(info) = info.as_deref() {
                new = new.with_info(parse_payload(info));
            }
            if let Some(metadata) = metadata.as_deref() {
                new = new.with_metadata(parse_payload(metadata));
            }
            new.done = done;
            new.truncated = truncated;

            let (node, order) = match run {
                Some(run) => {
                    let (node, order) = history.record_state(RunId(run), new)?;
                    (node, Some(order))
                }
                None => (history.create_state(new)?, None),
            };
            save_history(&history, settings)?;

            if json_mode {
                return print_json(&serde_json::json!({
                    "state": node,
                    "sequence_order": order,
                }));
            }
            match (run, order) {
                (Some(run), Some(order)) => {
                    println!("Created state {} at position {} of run {}", node.id, order, run);
                }
                _ => println!("Created state {}", node.id),
            }
        }
        StateCommand::Show { id } => {
            let node = history.get_state(StateId(id))?;
            if json_mode {
                return print_json(&node);
            }
            print_state(&node);
            if let Some(action) = &node.action {
                println!("  action: {}", action);
            }
            if let Some(info) = &node.info {
                println!("  info:   {}", info);
            }
            if let Some(metadata) = &node.metadata {
                println!("  metadata: {}", metadata);
            }
            println!("  created {}", node.created_at);
        }
    }
    Ok(())
}

pub fn cmd_run(settings: &Settings, json_mode: bool, action: RunCommand) -> Result<(), AppError> {
    let history = open_history(settings)?;

    let run = match action {
        RunCommand::Create {
            simulation,
            name,
            root,
            overrides,
            description,
            metadata,
        } => {
            let mut new = NewRun::new(SimulationId(simulation), name, StateId(root))
                .with_overrides(parse_config(overrides.as_deref())?);
            if let Some(description) = description {
                new = new.with_description(description);
            }
            if let Some(metadata) = metadata.as_deref() {
                new = new.with_metadata(parse_payload(metadata));
            }
            let run = history.create_run(new)?;
            save_history(&history, settings)?;
            run
        }
        RunCommand::List { simulation, status } => {
            let runs = history.list_runs(RunFilter {
                simulation_id: simulation.map(SimulationId),
                status,
            })?;
            if json_mode {
                return print_json(&runs);
            }
            for run in &runs {
                print_run(run);
            }
            println!("{} run(s)", runs.len());
            return Ok(());
        }
        RunCommand::Show { id } => history.get_run(RunId(id))?,
        RunCommand::Transition { id, status } => {
            let run = history.transition_run(RunId(id), status)?;
            save_history(&history, settings)?;
            run
        }
        RunCommand::Complete { id, reward } => {
            let run = history.complete_run(RunId(id), reward.as_deref().map(parse_payload))?;
            save_history(&history, settings)?;
            run
        }
    };

    if json_mode {
        return print_json(&run);
    }
    print_run(&run);
    if let Some(reward) = &run.total_reward {
        println!("  total reward: {}", reward);
    }
    Ok(())
}

pub fn cmd_append(
    settings: &Settings,
    json_mode: bool,
    run: u64,
    state: u64,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let order = history.append_state(RunId(run), StateId(state))?;
    save_history(&history, settings)?;

    if json_mode {
        return print_json(&api::AppendResponse {
            run_id: RunId(run),
            state_id: StateId(state),
            sequence_order: order,
        });
    }
    println!("Appended state {} to run {} at position {}", state, run, order);
    Ok(())
}

pub fn cmd_branch(
    settings: &Settings,
    json_mode: bool,
    run: u64,
    at: u64,
    name: String,
    overrides: Option<&str>,
    description: Option<String>,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let mut request = BranchRequest::new(RunId(run), StateId(at), name)
        .with_overrides(parse_config(overrides)?);
    if let Some(description) = description {
        request = request.with_description(description);
    }

    let branch = history.branch(request)?;
    save_history(&history, settings)?;

    if json_mode {
        return print_json(&branch);
    }
    println!(
        "Created branch {} ({}) from run {} at state {} with {} inherited step(s)",
        branch.id, branch.name, run, at, branch.total_steps
    );
    Ok(())
}

// =============================================================================
// QUERY COMMANDS
// =============================================================================

pub fn cmd_trajectory(settings: &Settings, json_mode: bool, run: u64) -> Result<(), AppError> {
    let history = open_history(settings)?;

    if json_mode {
        return print_json(&history.get_trajectory(RunId(run))?);
    }
    // Streamed, so long runs never sit in memory at once.
    let mut count = 0usize;
    for node in history.stream_trajectory(RunId(run))? {
        print_state(&node?);
        count += 1;
    }
    println!("{} state(s)", count);
    Ok(())
}

pub fn cmd_lineage(settings: &Settings, json_mode: bool, state: u64) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let path = history.get_lineage(StateId(state))?;
    if json_mode {
        return print_json(&path);
    }
    print_states(&path);
    Ok(())
}

pub fn cmd_children(settings: &Settings, json_mode: bool, state: u64) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let children = history.get_children(StateId(state))?;
    if json_mode {
        return print_json(&children);
    }
    print_states(&children);
    Ok(())
}

pub fn cmd_descendants(
    settings: &Settings,
    json_mode: bool,
    state: u64,
    limit: Option<usize>,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let nodes = history
        .descendants(StateId(state))?
        .take(limit.unwrap_or(usize::MAX))
        .collect::<Result<Vec<_>, _>>()?;
    if json_mode {
        return print_json(&nodes);
    }
    print_states(&nodes);
    Ok(())
}

pub fn cmd_terminal(
    settings: &Settings,
    json_mode: bool,
    min_reward: Option<f64>,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let nodes = history.terminal_states(min_reward)?;
    if json_mode {
        return print_json(&nodes);
    }
    print_states(&nodes);
    Ok(())
}

pub fn cmd_tree(settings: &Settings, json_mode: bool, simulation: u64) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let tree = history.get_run_tree(SimulationId(simulation))?;
    if json_mode {
        return print_json(&tree);
    }
    if tree.is_empty() {
        println!("Simulation {} has no runs", simulation);
    }
    print_tree(&tree, 0);
    Ok(())
}

pub fn cmd_config(
    settings: &Settings,
    json_mode: bool,
    run: u64,
    chain: bool,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let config = history.effective_config(RunId(run))?;
    let ancestors = if chain {
        history.inheritance_chain(RunId(run))?
    } else {
        Vec::new()
    };

    if json_mode {
        return print_json(&api::ConfigResponse {
            run_id: RunId(run),
            config,
            chain: ancestors.iter().map(|r| r.id).collect(),
        });
    }
    for (key, value) in &config {
        println!("  {} = {}", key, value);
    }
    if chain {
        println!();
        println!("Inherited through:");
        for ancestor in &ancestors {
            print_run(ancestor);
        }
    }
    Ok(())
}

pub fn cmd_compare(
    settings: &Settings,
    json_mode: bool,
    left: u64,
    right: u64,
) -> Result<(), AppError> {
    let history = open_history(settings)?;
    let cmp = history.compare_runs(RunId(left), RunId(right))?;
    if json_mode {
        return print_json(&cmp);
    }
    println!("Shared prefix: {} state(s)", cmp.shared.len());
    match &cmp.divergence_point {
        Some(node) => println!("Diverge after state {} (step {})", node.id, node.step_number),
        None => println!("No common history"),
    }
    println!("Only in run {}: {} state(s)", left, cmp.left_only.len());
    println!("Only in run {}: {} state(s)", right, cmp.right_only.len());
    Ok(())
}

// =============================================================================
// EXPORT / IMPORT COMMANDS
// =============================================================================

/// Export the store to a snapshot file.
pub fn cmd_export(
    settings: &Settings,
    output: &Path,
    format: SnapshotFormat,
) -> Result<(), AppError> {
    let validated_output = validate_output_path(output)?;
    let history = open_history(settings)?;
    let snapshot = history.snapshot()?;

    let data = match format {
        SnapshotFormat::Binary => snapshot.to_bytes()?,
        SnapshotFormat::Json => snapshot.to_json()?.into_bytes(),
    };
    std::fs::write(&validated_output, &data)
        .map_err(AppError::io(format!("Write {}", validated_output.display())))?;

    println!("Checksum: {}", snapshot.checksum());
    println!("BLAKE3:   {}", snapshot.crypto_hash()?);
    println!(
        "Exported {} bytes to {}",
        data.len(),
        validated_output.display()
    );
    Ok(())
}

/// Import a snapshot into the (empty) configured store.
pub fn cmd_import(settings: &Settings, input: &Path) -> Result<(), AppError> {
    let snapshot = read_snapshot(input)?;
    let history = open_history(settings)?;
    history.restore(&snapshot)?;
    save_history(&history, settings)?;

    let stats = history.stats()?;
    println!(
        "Imported {} simulation(s), {} state(s), {} run(s)",
        stats.simulations, stats.states, stats.runs
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::settings::StorageSettings;
    use clap::Parser;
    use serde_json::json;

    fn file_settings(path: PathBuf) -> Settings {
        Settings {
            storage: StorageSettings {
                backend: Backend::File,
                path,
            },
            ..Settings::default()
        }
    }

    #[test]
    fn payload_falls_back_to_text() {
        assert_eq!(parse_payload("{\"x\": 1}"), Payload::new(json!({"x": 1})));
        assert_eq!(parse_payload("3.5"), Payload::from(3.5));
        assert_eq!(parse_payload("hello world"), Payload::from("hello world"));
    }

    #[test]
    fn config_must_be_an_object() {
        assert!(parse_config(None).expect("empty").is_empty());
        let config = parse_config(Some(r#"{"lr": 0.1}"#)).expect("object");
        assert_eq!(config.get("lr"), Some(&Payload::from(0.1)));
        assert!(matches!(parse_config(Some("[1, 2]")), Err(AppError::Usage(_))));
    }

    #[test]
    fn file_backend_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = file_settings(dir.path().join("history.snapshot"));

        let history = open_history(&settings).expect("open empty");
        let sim = history
            .create_simulation(NewSimulation::new("sim", "env", "agent"))
            .expect("sim");
        let root = history.create_state(NewState::root("s0")).expect("root");
        let run = history
            .create_run(NewRun::new(sim.id, "main", root.id))
            .expect("run");
        save_history(&history, &settings).expect("save");

        let reopened = open_history(&settings).expect("reopen");
        assert_eq!(reopened.get_run(run.id).expect("run"), run);
        assert_eq!(reopened.stats().expect("stats"), history.stats().expect("stats"));
    }

    #[test]
    fn json_snapshots_are_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let history = History::in_memory();
        history.create_state(NewState::root("s0")).expect("root");
        let path = dir.path().join("snap.json");
        std::fs::write(&path, history.snapshot().expect("snap").to_json().expect("json"))
            .expect("write");

        let snapshot = read_snapshot(&path).expect("read");
        assert_eq!(snapshot.states.len(), 1);
    }

    #[test]
    fn state_and_run_payload_flags_are_stored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = file_settings(dir.path().join("history.snapshot"));

        cmd_simulation(
            &settings,
            true,
            SimulationCommand::Create {
                name: "sim".to_string(),
                env: "env".to_string(),
                agent: "agent".to_string(),
                agent_config: None,
                env_config: None,
                description: Some("grid sweep".to_string()),
                max_steps: Some(200),
                seed: Some(7),
                tags: Vec::new(),
            },
        )
        .expect("simulation");
        cmd_state(
            &settings,
            true,
            StateCommand::Create {
                parent: None,
                step: 0,
                observation: "s0".to_string(),
                action: None,
                reward: None,
                done: false,
                truncated: false,
                info: Some(r#"{"lives": 3}"#.to_string()),
                metadata: Some("seeded by hand".to_string()),
                run: None,
            },
        )
        .expect("state");
        cmd_run(
            &settings,
            true,
            RunCommand::Create {
                simulation: 1,
                name: "main".to_string(),
                root: 1,
                overrides: None,
                description: None,
                metadata: Some(r#"{"host": "gpu-3"}"#.to_string()),
            },
        )
        .expect("run");

        let history = open_history(&settings).expect("reopen");
        let sim = history.get_simulation(SimulationId(1)).expect("sim");
        assert_eq!(sim.description.as_deref(), Some("grid sweep"));
        assert_eq!(sim.max_steps, Some(200));
        assert_eq!(sim.seed, Some(7));
        let state = history.get_state(StateId(1)).expect("state");
        assert_eq!(state.info, Some(Payload::new(json!({"lives": 3}))));
        assert_eq!(state.metadata, Some(Payload::from("seeded by hand")));
        let run = history.get_run(RunId(1)).expect("run");
        assert_eq!(run.metadata, Some(Payload::new(json!({"host": "gpu-3"}))));
    }

    #[test]
    fn payload_flags_parse() {
        let cli = Cli::try_parse_from([
            "simtree", "state", "create", "-o", "x", "--info", "{\"k\":1}", "--metadata", "m",
        ])
        .expect("parse");
        let Some(Commands::State {
            action: StateCommand::Create { info, metadata, .. },
        }) = cli.command
        else {
            panic!("expected state create");
        };
        assert_eq!(info.as_deref(), Some("{\"k\":1}"));
        assert_eq!(metadata.as_deref(), Some("m"));
    }

    #[test]
    fn compact_rejects_file_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = file_settings(dir.path().join("history.snapshot"));
        assert!(matches!(cmd_compact(&settings), Err(AppError::Usage(_))));
    }

    #[test]
    fn compact_keeps_redb_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            storage: StorageSettings {
                backend: Backend::Redb,
                path: dir.path().join("history.db"),
            },
            ..Settings::default()
        };
        {
            let history = open_history(&settings).expect("open");
            history.create_state(NewState::root("s0")).expect("root");
        }

        cmd_compact(&settings).expect("compact");
        let history = open_history(&settings).expect("reopen");
        assert_eq!(history.stats().expect("stats").states, 1);
    }

    #[test]
    fn output_path_requires_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(validate_output_path(&dir.path().join("out.bin")).is_ok());
        assert!(validate_output_path(&dir.path().join("missing/out.bin")).is_err());
    }
}
