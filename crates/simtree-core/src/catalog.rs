//! Simulation templates.
//!
//! A simulation names an environment and an agent and carries the base
//! agent configuration that every run of it inherits.

use crate::registry::{validate_description, validate_name};
use crate::repository::{IdKind, ReadTxn, Repository};
use crate::types::{NewSimulation, SimtreeError, Simulation, SimulationId};
use chrono::Utc;

pub struct SimulationCatalog;

impl SimulationCatalog {
    /// Register a simulation template.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the name, environment name, or agent type
    /// is empty or too long.
    pub fn create<R: Repository>(
        repo: &R,
        new: NewSimulation,
    ) -> Result<Simulation, SimtreeError> {
        validate_name(&new.name)?;
        validate_name(&new.environment_name)?;
        validate_name(&new.agent_type)?;
        validate_description(new.description.as_deref())?;

        let simulation = repo.write(|txn| {
            let simulation = Simulation {
                id: SimulationId(txn.allocate_id(IdKind::Simulation)?),
                name: new.name,
                description: new.description,
                environment_name: new.environment_name,
                environment_config: new.environment_config,
                agent_type: new.agent_type,
                agent_config: new.agent_config,
                max_steps: new.max_steps,
                seed: new.seed,
                tags: new.tags,
                created_at: Utc::now(),
            };
            txn.put_simulation(&simulation)?;
            Ok(simulation)
        })?;
        tracing::info!(simulation_id = %simulation.id, name = %simulation.name, "simulation created");
        Ok(simulation)
    }

    pub fn get<R: Repository>(repo: &R, id: SimulationId) -> Result<Simulation, SimtreeError> {
        repo.read(|txn| Self::require_in(txn, id))
    }

    pub(crate) fn require_in<T: ReadTxn + ?Sized>(
        txn: &T,
        id: SimulationId,
    ) -> Result<Simulation, SimtreeError> {
        txn.simulation(id)?
            .ok_or(SimtreeError::SimulationNotFound(id))
    }

    /// All simulations, ascending by id.
    pub fn list<R: Repository>(repo: &R) -> Result<Vec<Simulation>, SimtreeError> {
        repo.read(|txn| txn.simulations())
    }
}
