//! Bounded run loop with pause, pacing and shutdown.
//!
//! [`run_simulation`] drives [`Simulation::step`] until one of:
//!
//! - **Tick limit**: `max_ticks` ticks have run in this call
//! - **Run-until condition**: e.g. no entity holds a given record kind
//! - **Stop request**: [`RunControl::request_stop`] was called
//!
//! A normal end drains outstanding background calls within the drain
//! budget; a stop cancels them. Either way, actions left open resolve to
//! `action_failed`.

use std::sync::Arc;
use std::time::Duration;

use cadence_store::RecordKind;
use cadence_types::RunId;
use tracing::{info, warn};

use crate::config::SimulationSection;
use crate::control::{RunControl, SimulationEndReason};
use crate::simulation::{Simulation, SimulationError, TickSummary};

/// Condition that ends a run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunUntil {
    /// Stop once no entity holds a record of this kind.
    NoEntitiesWith(RecordKind),
}

impl RunUntil {
    /// Whether the condition holds for `sim` now.
    pub fn is_met(&self, sim: &Simulation) -> bool {
        match self {
            Self::NoEntitiesWith(kind) => sim.store().count_with(*kind) == 0,
        }
    }
}

/// Limits of one [`run_simulation`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBounds {
    /// Ticks to run in this call. `None` runs until stopped or the
    /// condition is met.
    pub max_ticks: Option<u64>,
    /// Optional early-end condition, checked after every tick.
    pub until: Option<RunUntil>,
}

impl RunBounds {
    /// Bounds from the `simulation` config section (0 = unlimited).
    pub fn from_config(section: &SimulationSection) -> Self {
        Self {
            max_ticks: (section.max_ticks > 0).then_some(section.max_ticks),
            until: None,
        }
    }

    /// Add a run-until condition.
    #[must_use]
    pub const fn until(mut self, until: RunUntil) -> Self {
        self.until = Some(until);
        self
    }

    fn limit_reached(&self, total_ticks: u64) -> bool {
        self.max_ticks.is_some_and(|max| total_ticks >= max)
    }
}

/// Errors that can occur during the run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A tick or the shutdown sequence failed.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying simulation error.
        #[from]
        source: SimulationError,
    },
}

/// Result of a run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The reason the run ended.
    pub end_reason: SimulationEndReason,
    /// The last tick summary, if any tick completed.
    pub final_summary: Option<TickSummary>,
    /// Ticks executed by this call.
    pub total_ticks: u64,
    /// Next tick to execute.
    pub next_tick: u64,
    /// Run identifier.
    pub run_id: RunId,
    /// Actions failed during shutdown.
    pub failed_at_shutdown: usize,
}

/// Callback invoked after each tick completes.
pub trait TickCallback: Send {
    /// Called after a tick completes successfully.
    fn on_tick(&mut self, summary: &TickSummary, sim: &Simulation);
}

/// A no-op tick callback.
pub struct NoOpCallback;

impl TickCallback for NoOpCallback {
    fn on_tick(&mut self, _summary: &TickSummary, _sim: &Simulation) {}
}

/// Run `sim` until a bound, the run-until condition or a stop request.
///
/// # Errors
///
/// Returns [`RunnerError`] if a tick fails on a fatal error. Background
/// work is cancelled before returning it.
pub async fn run_simulation(
    sim: &mut Simulation,
    control: &Arc<RunControl>,
    bounds: &RunBounds,
    callback: &mut dyn TickCallback,
) -> Result<SimulationResult, RunnerError> {
    let mut last_summary: Option<TickSummary> = None;
    let mut total_ticks: u64 = 0;

    info!(
        run_id = %sim.run_id(),
        start_tick = sim.tick(),
        max_ticks = bounds.max_ticks,
        tick_interval_ms = control.tick_interval_ms(),
        "Simulation starting"
    );

    let reason = loop {
        // --- Check pause ---
        if control.is_paused() {
            info!("Simulation paused, waiting for resume...");
            control.wait_if_paused().await;
            info!("Simulation resumed");
        }

        // --- Check stop request (before tick) ---
        if control.is_stop_requested() {
            info!("Stop requested");
            break SimulationEndReason::StopRequested;
        }

        if bounds.limit_reached(total_ticks) {
            break SimulationEndReason::MaxTicksReached;
        }

        // --- Execute tick ---
        let summary = match sim.step(control).await {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(shutdown) = sim.shutdown(false).await {
                    warn!(error = %shutdown, "Shutdown after a failed tick also failed");
                }
                return Err(e.into());
            }
        };
        total_ticks = total_ticks.saturating_add(1);

        // --- Notify callback ---
        callback.on_tick(&summary, sim);

        let tick = summary.tick;
        last_summary = Some(summary);

        if control.is_stop_requested() {
            info!(tick, "Stop requested during tick");
            break SimulationEndReason::StopRequested;
        }

        // --- Check run-until condition ---
        if bounds.until.is_some_and(|until| until.is_met(sim)) {
            info!(tick, "Run-until condition met");
            break SimulationEndReason::ConditionMet;
        }

        // --- Check tick limit (after tick) ---
        if bounds.limit_reached(total_ticks) {
            info!(tick, max_ticks = bounds.max_ticks, "Tick limit reached");
            break SimulationEndReason::MaxTicksReached;
        }

        // --- Sleep for tick interval ---
        let interval_ms = control.tick_interval_ms();
        if interval_ms > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                () = control.stopped() => {}
            }
        }
    };

    let drain = reason != SimulationEndReason::StopRequested;
    let failed_at_shutdown = sim.shutdown(drain).await?;
    control.set_end_reason(reason.clone()).await;

    Ok(SimulationResult {
        end_reason: reason,
        final_summary: last_summary,
        total_ticks,
        next_tick: sim.tick(),
        run_id: sim.run_id(),
        failed_at_shutdown,
    })
}

/// Log the end of a run.
pub fn log_simulation_end(result: &SimulationResult) {
    info!(
        run_id = %result.run_id,
        reason = ?result.end_reason,
        total_ticks = result.total_ticks,
        next_tick = result.next_tick,
        failed_at_shutdown = result.failed_at_shutdown,
        "Simulation ended"
    );

    if let Some(ref summary) = result.final_summary {
        info!(
            tick = summary.tick,
            entities = summary.entities,
            resolved = summary.resolved,
            faults = summary.faults.len(),
            "Final tick summary"
        );
    } else {
        warn!("Simulation ended with no ticks executed");
    }
}
