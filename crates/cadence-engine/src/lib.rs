//! Scenario loading, built-in units and run assembly for the `cadence`
//! binary.
//!
//! # Modules
//!
//! - [`catalog`] -- Built-in records, units and signal modifiers.
//! - [`error`] -- [`ScenarioError`] and the binary's [`EngineError`].
//! - [`scenario`] -- The scenario document and its validation.

pub mod catalog;
pub mod error;
pub mod scenario;

use cadence_core::{CadenceConfig, RunBounds, Simulation};
use cadence_events::Telemetry;
use tracing::info;

pub use error::{EngineError, ScenarioError};
pub use scenario::Scenario;

/// Assemble a simulation at tick 0 from `scenario`.
///
/// The scenario's seed, when present, replaces the configured one.
/// Units are registered in scenario order.
pub fn build_simulation(
    scenario: &Scenario,
    config: &CadenceConfig,
    telemetry: Telemetry,
) -> Result<Simulation, ScenarioError> {
    let mut config = config.clone();
    if let Some(seed) = scenario.seed {
        config.simulation.seed = seed;
    }
    if config.simulation.name == CadenceConfig::default().simulation.name {
        config.simulation.name.clone_from(&scenario.name);
    }

    let registry = catalog::registry();
    let store = scenario.seed_store(&registry)?;
    let actions = scenario.action_table();

    let units = scenario
        .units
        .iter()
        .map(|spec| Ok((catalog::build_unit(spec, &actions, &registry)?, spec.strategy)))
        .collect::<Result<Vec<_>, ScenarioError>>()?;

    let mut builder = Simulation::builder(&config)
        .store(store)
        .registry(registry)
        .actions(actions)
        .telemetry(telemetry);
    for spec in &scenario.modifiers {
        builder = builder.modifier(catalog::build_modifier(spec)?);
    }

    let mut sim = builder.build();
    for (unit, strategy) in units {
        sim.register(unit, strategy)?;
    }

    info!(
        scenario = %scenario.name,
        units = scenario.units.len(),
        modifiers = scenario.modifiers.len(),
        "Scenario assembled"
    );
    Ok(sim)
}

/// Bounds for a run of `scenario`.
///
/// The tick limit comes from `ticks_override`, then the scenario's
/// `run.ticks`, then `simulation.max_ticks` (0 = unlimited).
pub fn run_bounds(
    scenario: &Scenario,
    config: &CadenceConfig,
    ticks_override: Option<u64>,
) -> Result<RunBounds, ScenarioError> {
    let mut bounds = RunBounds::from_config(&config.simulation);
    if let Some(ticks) = ticks_override.or(scenario.run.ticks) {
        bounds.max_ticks = Some(ticks);
    }
    if let Some(until) = scenario.run_until(&catalog::registry())? {
        bounds = bounds.until(until);
    }
    Ok(bounds)
}
