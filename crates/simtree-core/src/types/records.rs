//! Stored records and their creation requests.

use super::{ConfigMap, EntryId, Payload, RunId, SimulationId, SimtreeError, StateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// STATE NODE
// =============================================================================

/// One recorded snapshot of a simulated environment.
///
/// Immutable once created. Many runs may reference the same node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    pub id: StateId,
    /// `None` only for root states.
    pub parent_id: Option<StateId>,
    pub step_number: u64,
    pub observation: Payload,
    pub action: Option<Payload>,
    pub reward: Option<f64>,
    pub done: bool,
    pub truncated: bool,
    pub info: Option<Payload>,
    pub metadata: Option<Payload>,
    pub created_at: DateTime<Utc>,
}

impl StateNode {
    pub(crate) fn from_new(id: StateId, new: NewState, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            parent_id: new.parent_id,
            step_number: new.step_number,
            observation: new.observation,
            action: new.action,
            reward: new.reward,
            done: new.done,
            truncated: new.truncated,
            info: new.info,
            metadata: new.metadata,
            created_at,
        }
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// A terminal state ended its episode (`done`).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.done
    }
}

/// Request to record a new [`StateNode`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewState {
    #[serde(default)]
    pub parent_id: Option<StateId>,
    #[serde(default)]
    pub step_number: u64,
    #[serde(default)]
    pub observation: Payload,
    #[serde(default)]
    pub action: Option<Payload>,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub info: Option<Payload>,
    #[serde(default)]
    pub metadata: Option<Payload>,
}

impl NewState {
    /// A root state at step 0.
    #[must_use]
    pub fn root(observation: impl Into<Payload>) -> Self {
        Self {
            observation: observation.into(),
            ..Self::default()
        }
    }

    /// A child of `parent` at the given step.
    #[must_use]
    pub fn child(parent: StateId, step_number: u64, observation: impl Into<Payload>) -> Self {
        Self {
            parent_id: Some(parent),
            step_number,
            observation: observation.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<Payload>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub const fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    #[must_use]
    pub fn with_info(mut self, info: impl Into<Payload>) -> Self {
        self.info = Some(info.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<Payload>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Mark the episode as finished.
    #[must_use]
    pub const fn done(mut self) -> Self {
        self.done = true;
        self
    }

    /// Mark the episode as cut short.
    #[must_use]
    pub const fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// Template describing an environment and agent. Runs are instances of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub id: SimulationId,
    pub name: String,
    pub description: Option<String>,
    pub environment_name: String,
    pub environment_config: ConfigMap,
    pub agent_type: String,
    /// Base layer for every run's effective configuration.
    pub agent_config: ConfigMap,
    pub max_steps: Option<u64>,
    pub seed: Option<u64>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Request to register a new [`Simulation`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSimulation {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub environment_name: String,
    #[serde(default)]
    pub environment_config: ConfigMap,
    pub agent_type: String,
    #[serde(default)]
    pub agent_config: ConfigMap,
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewSimulation {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        environment_name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            environment_name: environment_name.into(),
            agent_type: agent_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_agent_config(mut self, config: ConfigMap) -> Self {
        self.agent_config = config;
        self
    }

    #[must_use]
    pub fn with_environment_config(mut self, config: ConfigMap) -> Self {
        self.environment_config = config;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

// =============================================================================
// RUN STATUS
// =============================================================================

/// Lifecycle status of a run.
///
/// ```text
/// active <-> paused
///   |          |
///   v          v
/// completed / failed   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub const ALL: [Self; 4] = [Self::Active, Self::Paused, Self::Completed, Self::Failed];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed runs never change status again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    /// Self-transitions are not edges.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Paused | Self::Completed | Self::Failed)
                | (Self::Paused, Self::Active | Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = SimtreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SimtreeError::InvalidInput(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

// =============================================================================
// RUN
// =============================================================================

/// One execution (trajectory) of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub simulation_id: SimulationId,
    pub name: String,
    pub description: Option<String>,
    /// First state of the trajectory. For a branch this is the branch point.
    pub root_state_id: StateId,
    /// Last state appended (the branch point right after branching).
    pub current_state_id: StateId,
    pub parent_run_id: Option<RunId>,
    pub branch_point_state_id: Option<StateId>,
    /// This run's own overrides only; see `config::effective_config`.
    pub config_overrides: ConfigMap,
    pub status: RunStatus,
    pub total_steps: u64,
    pub total_reward: Option<Payload>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Option<Payload>,
}

impl Run {
    /// A branch always has both a parent run and a branch point.
    #[must_use]
    pub const fn is_branch(&self) -> bool {
        self.parent_run_id.is_some()
    }
}

/// Request to create an origin (non-branch) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub simulation_id: SimulationId,
    pub name: String,
    pub root_state_id: StateId,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config_overrides: ConfigMap,
    #[serde(default)]
    pub metadata: Option<Payload>,
}

impl NewRun {
    #[must_use]
    pub fn new(simulation_id: SimulationId, name: impl Into<String>, root_state_id: StateId) -> Self {
        Self {
            simulation_id,
            name: name.into(),
            root_state_id,
            description: None,
            config_overrides: ConfigMap::new(),
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

    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<Payload>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Optional filters for listing runs. Empty filter lists everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    pub simulation_id: Option<SimulationId>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        self.simulation_id.is_none_or(|s| s == run.simulation_id)
            && self.status.is_none_or(|s| s == run.status)
    }
}

// =============================================================================
// TRAJECTORY ENTRY
// =============================================================================

/// Association of a state with a run at an ordinal position.
///
/// Orders within one run are exactly `0..len`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub id: EntryId,
    pub run_id: RunId,
    pub state_id: StateId,
    pub sequence_order: u64,
    pub created_at: DateTime<Utc>,
}
