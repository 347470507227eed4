//! Unit scheduling, action resolution, checkpoints and the run loop of the
//! Cadence simulation core.
//!
//! This crate turns a [`StateStore`] and an [`EventBus`] into a running
//! simulation: units are registered with an execution [`Strategy`], each
//! tick runs them through the [`Scheduler`], proposed actions travel the
//! [`ActionProtocol`] to exactly one resolution, and the whole run can be
//! captured as a versioned [`Snapshot`] and restored.
//!
//! # Modules
//!
//! - [`checkpoint`] -- Versioned snapshots, atomic save/load, periodic
//!   checkpointing and pruning.
//! - [`config`] -- Configuration loading from YAML into strongly-typed
//!   structs, with environment overrides.
//! - [`control`] -- [`RunControl`]: pause, resume, pacing and shutdown.
//! - [`protocol`] -- The action resolution protocol and its payloads.
//! - [`runner`] -- [`run_simulation`], the bounded run loop.
//! - [`scheduler`] -- Per-tick unit scheduling with failure isolation.
//! - [`simulation`] -- [`Simulation`], the orchestrator owning one run.
//! - [`unit`] -- The [`Unit`] contract and [`PendingCall`] suspension point.
//! - [`world`] -- [`World`]: store, bus and random stream of a run.
//!
//! [`StateStore`]: cadence_store::StateStore
//! [`EventBus`]: cadence_events::EventBus

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod protocol;
pub mod runner;
pub mod scheduler;
pub mod simulation;
pub mod unit;
pub mod world;

pub use cadence_types::SimRng;
pub use checkpoint::{CheckpointError, CheckpointManager, Restored, SNAPSHOT_FORMAT_VERSION, Snapshot};
pub use config::{CadenceConfig, ConfigError};
pub use control::{RunControl, SimulationEndReason};
pub use protocol::{ActionProtocol, ActionTable, ProtocolStats, SignalModifier};
pub use runner::{
    NoOpCallback, RunBounds, RunUntil, RunnerError, SimulationResult, TickCallback, log_simulation_end,
    run_simulation,
};
pub use scheduler::{Scheduler, SchedulerError, TickError, TickReport, UnitStatus};
pub use simulation::{Simulation, SimulationBuilder, SimulationError, TickSummary};
pub use unit::{AbandonReason, CallError, CallOutcome, PendingCall, Strategy, Turn, Unit, UnitError};
pub use world::World;
