//! Shared type definitions for the Cadence simulation core.
//!
//! Every other crate in the workspace speaks in these types: entity and
//! run identifiers, the immutable [`Event`] message, the [`Fault`]
//! taxonomy of reported (non-fatal) conditions, the append-only
//! [`TelemetryRecord`], record [`Validation`] results and the seeded
//! [`SimRng`] whose stream position is captured by checkpoints.
//!
//! # Modules
//!
//! - [`ids`] -- Counter-based and UUID identifiers
//! - [`event`] -- Named event payloads exchanged over the bus
//! - [`fault`] -- Conditions caught at the scheduler/bus boundary
//! - [`rng`] -- Deterministic random stream with restorable position
//! - [`telemetry`] -- Records of the structured telemetry stream
//! - [`validation`] -- Pass/fail plus diagnostics for record checks

pub mod event;
pub mod fault;
pub mod ids;
pub mod rng;
pub mod telemetry;
pub mod validation;

pub use event::{Event, EventData, data_from};
pub use fault::Fault;
pub use ids::{ActionKey, EntityId, RunId, SubscriptionId};
pub use rng::{RngState, SimRng};
pub use telemetry::{TelemetryKind, TelemetryRecord};
pub use validation::Validation;
