//! In-process event bus for the Cadence simulation core.
//!
//! Publishing is synchronous and depth-first: every handler subscribed to
//! a name runs, in subscription order, before `publish` returns. Handlers
//! may publish again from inside a delivery. Each publish iterates over a
//! copy of the subscriber list taken when it started, so subscribing or
//! unsubscribing mid-delivery never disturbs the delivery in progress.
//!
//! Handlers receive a [`Dispatch`] context carrying the tick number, the
//! state store, the run's random stream and the current nesting depth.
//! Every publish and every caught handler fault is appended to the
//! [`Telemetry`] stream.
//!
//! # Modules
//!
//! - [`bus`] -- [`EventBus`] subscription table and delivery
//! - [`dispatch`] -- [`Dispatch`], the per-turn context handed to handlers and units
//! - [`error`] -- [`BusError`] returned by handlers, [`TelemetryError`]
//! - [`telemetry`] -- [`TelemetrySink`] and the memory/JSON-lines/null sinks

pub mod bus;
pub mod dispatch;
pub mod error;
pub mod telemetry;

pub use bus::{DEFAULT_MAX_DEPTH, EventBus, Handler, MIN_MAX_DEPTH, panic_message};
pub use dispatch::Dispatch;
pub use error::{BusError, TelemetryError};
pub use telemetry::{JsonLinesTelemetry, MemoryTelemetry, NullTelemetry, Telemetry, TelemetrySink};
