//! # Simtree CLI Module
//!
//! ## Available Commands
//!
//! - `init`, `status`, `verify`, `compact` - database lifecycle and health
//! - `simulation create|list` - simulation templates
//! - `state create|show` - record and inspect states
//! - `run create|list|show|transition|complete` - run lifecycle
//! - `append`, `branch` - extend or fork a run
//! - `trajectory`, `lineage`, `children`, `descendants`, `terminal`, `tree`,
//!   `config`, `compare` - queries
//! - `export`, `import` - snapshots
//! - `server` - start the HTTP server

mod commands;

use crate::error::AppError;
use crate::settings::{Backend, Settings};
use clap::{Parser, Subcommand, ValueEnum};
use simtree_core::RunStatus;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Simtree - branchable trajectory store
///
/// Records simulation runs as a tree of immutable states and forks new runs
/// from any recorded state.
#[derive(Parser, Debug)]
#[command(name = "simtree")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the history database [default: simtree.db]
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend [default: redb]
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Path to a simtree.toml settings file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Resolve settings: flags over environment over file over defaults.
    pub fn settings(&self) -> Result<Settings, AppError> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(path) = &self.database {
            settings.storage.path = path.clone();
        }
        if let Some(backend) = self.backend {
            settings.storage.backend = backend;
        }
        if let Some(Commands::Server { host, port }) = &self.command {
            if let Some(host) = host {
                settings.server.host = host.clone();
            }
            if let Some(port) = port {
                settings.server.port = *port;
            }
        }
        Ok(settings)
    }
}

/// Snapshot file encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SnapshotFormat {
    /// Magic header + postcard payload
    #[default]
    Binary,
    /// Pretty-printed JSON
    Json,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    ///
    /// With the `file` backend the snapshot file is rewritten after every
    /// mutating request.
    Server {
        /// Host to bind to [default: 127.0.0.1]
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to [default: 8080]
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show store counts
    Status,

    /// Check the state tree for cycles and orphans
    Verify,

    /// Reclaim free space in the redb database file
    Compact,

    /// Manage simulation templates
    Simulation {
        #[command(subcommand)]
        action: SimulationCommand,
    },

    /// Record and inspect states
    State {
        #[command(subcommand)]
        action: StateCommand,
    },

    /// Manage runs
    Run {
        #[command(subcommand)]
        action: RunCommand,
    },

    /// Append an existing state to a run
    Append {
        /// Run ID
        #[arg(short, long)]
        run: u64,

        /// State ID
        #[arg(short, long)]
        state: u64,
    },

    /// Fork a run at one of its states
    Branch {
        /// Parent run ID
        #[arg(short, long)]
        run: u64,

        /// Branch point state ID (must be in the parent's trajectory)
        #[arg(short, long)]
        at: u64,

        /// Name of the new run
        #[arg(short, long)]
        name: String,

        /// Config overrides as a JSON object
        #[arg(short, long)]
        overrides: Option<String>,

        /// Description [default: "Branched from <parent> at step <n>"]
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Print a run's trajectory in order
    Trajectory {
        /// Run ID
        run: u64,
    },

    /// Print the path from the root to a state
    Lineage {
        /// State ID
        state: u64,
    },

    /// Print the direct children of a state
    Children {
        /// State ID
        state: u64,
    },

    /// Print all descendants of a state, breadth first
    Descendants {
        /// State ID
        state: u64,

        /// Stop after this many states
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print terminal (done) states
    Terminal {
        /// Only states with at least this reward
        #[arg(short, long)]
        min_reward: Option<f64>,
    },

    /// Print the branch hierarchy of a simulation
    Tree {
        /// Simulation ID
        simulation: u64,
    },

    /// Print a run's effective configuration
    Config {
        /// Run ID
        run: u64,

        /// Also list the runs it inherits from
        #[arg(long)]
        chain: bool,
    },

    /// Compare the trajectories of two runs
    Compare {
        /// Left run ID
        left: u64,

        /// Right run ID
        right: u64,
    },

    /// Export the whole store to a snapshot file
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Snapshot encoding
        #[arg(short = 't', long, value_enum, default_value_t = SnapshotFormat::Binary)]
        format: SnapshotFormat,
    },

    /// Import a snapshot file into an empty store
    Import {
        /// Input file path (binary or JSON snapshot)
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum SimulationCommand {
    /// Register a simulation template
    Create {
        /// Simulation name
        #[arg(short, long)]
        name: String,

        /// Environment identifier (e.g. CartPole-v1)
        #[arg(short, long)]
        env: String,

        /// Agent type (e.g. ppo)
        #[arg(short, long)]
        agent: String,

        /// Base agent config as a JSON object
        #[arg(long)]
        agent_config: Option<String>,

        /// Environment config as a JSON object
        #[arg(long)]
        env_config: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long)]
        max_steps: Option<u64>,

        #[arg(long)]
        seed: Option<u64>,

        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// List simulation templates
    List,
}

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// Record a new state
    Create {
        /// Parent state ID (omit for a root)
        #[arg(short, long)]
        parent: Option<u64>,

        /// Step number within the episode
        #[arg(short, long, default_value = "0")]
        step: u64,

        /// Observation (JSON, or plain text)
        #[arg(short, long)]
        observation: String,

        /// Action (JSON, or plain text)
        #[arg(short, long)]
        action: Option<String>,

        #[arg(short, long)]
        reward: Option<f64>,

        /// Episode ended naturally
        #[arg(long)]
        done: bool,

        /// Episode was cut short
        #[arg(long)]
        truncated: bool,

        /// Environment info (JSON, or plain text)
        #[arg(long)]
        info: Option<String>,

        /// Free-form metadata (JSON, or plain text)
        #[arg(long)]
        metadata: Option<String>,

        /// Append the new state to this run in the same transaction
        #[arg(long)]
        run: Option<u64>,
    },

    /// Show one state
    Show {
        /// State ID
        id: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum RunCommand {
    /// Start an origin run at a root state
    Create {
        /// Simulation ID
        #[arg(short, long)]
        simulation: u64,

        /// Run name
        #[arg(short, long)]
        name: String,

        /// Root state ID
        #[arg(short, long)]
        root: u64,

        /// Config overrides as a JSON object
        #[arg(short, long)]
        overrides: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        /// Free-form run metadata (JSON, or plain text)
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List runs
    List {
        /// Only runs of this simulation
        #[arg(short, long)]
        simulation: Option<u64>,

        /// Only runs in this status
        #[arg(long)]
        status: Option<RunStatus>,
    },

    /// Show one run
    Show {
        /// Run ID
        id: u64,
    },

    /// Change a run's status
    Transition {
        /// Run ID
        id: u64,

        /// Target status (active, paused, completed, failed)
        status: RunStatus,
    },

    /// Mark a run completed
    Complete {
        /// Run ID
        id: u64,

        /// Final total reward (JSON); keeps the accumulated reward if omitted
        #[arg(short, long)]
        reward: Option<String>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with resolved settings.
pub async fn execute(cli: Cli, settings: Settings) -> Result<(), AppError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { .. }) => cmd_server(&settings).await,
        Some(Commands::Init { force }) => cmd_init(&settings, force),
        Some(Commands::Status) | None => cmd_status(&settings, json_mode),
        Some(Commands::Verify) => cmd_verify(&settings, json_mode),
        Some(Commands::Compact) => cmd_compact(&settings),
        Some(Commands::Simulation { action }) => cmd_simulation(&settings, json_mode, action),
        Some(Commands::State { action }) => cmd_state(&settings, json_mode, action),
        Some(Commands::Run { action }) => cmd_run(&settings, json_mode, action),
        Some(Commands::Append { run, state }) => cmd_append(&settings, json_mode, run, state),
        Some(Commands::Branch {
            run,
            at,
            name,
            overrides,
            description,
        }) => cmd_branch(
            &settings,
            json_mode,
            run,
            at,
            name,
            overrides.as_deref(),
            description,
        ),
        Some(Commands::Trajectory { run }) => cmd_trajectory(&settings, json_mode, run),
        Some(Commands::Lineage { state }) => cmd_lineage(&settings, json_mode, state),
        Some(Commands::Children { state }) => cmd_children(&settings, json_mode, state),
        Some(Commands::Descendants { state, limit }) => {
            cmd_descendants(&settings, json_mode, state, limit)
        }
        Some(Commands::Terminal { min_reward }) => cmd_terminal(&settings, json_mode, min_reward),
        Some(Commands::Tree { simulation }) => cmd_tree(&settings, json_mode, simulation),
        Some(Commands::Config { run, chain }) => cmd_config(&settings, json_mode, run, chain),
        Some(Commands::Compare { left, right }) => cmd_compare(&settings, json_mode, left, right),
        Some(Commands::Export { output, format }) => cmd_export(&settings, &output, format),
        Some(Commands::Import { input }) => cmd_import(&settings, &input),
    }
}
