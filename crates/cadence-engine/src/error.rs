//! Error types for scenario loading and the `cadence` binary.
//!
//! [`ScenarioError`] covers everything that can be wrong with a scenario
//! before tick 0. [`EngineError`] is the top-level error `main` propagates.

use std::path::PathBuf;

use cadence_core::{CheckpointError, ConfigError, RunnerError, SimulationError};
use cadence_events::TelemetryError;
use cadence_store::StoreError;

/// A scenario that cannot be loaded or fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Reading the scenario file failed.
    #[error("failed to read scenario {}: {source}", path.display())]
    Io {
        /// Scenario path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// YAML parsing failed.
    #[error("scenario YAML parse error: {source}")]
    Yaml {
        /// The underlying YAML error.
        source: serde_yml::Error,
    },

    /// JSON parsing failed.
    #[error("scenario JSON parse error: {source}")]
    Json {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// Field-level validation failed.
    #[error("scenario is invalid: {source}")]
    Invalid {
        /// Every failing field.
        #[from]
        source: validator::ValidationErrors,
    },

    /// A record kind has no registered decoder.
    #[error("unknown record kind {kind}{}", entity.map(|i| format!(" (entity #{i})")).unwrap_or_default())]
    UnknownRecordKind {
        /// Index of the entity in the scenario, when the kind came from one.
        entity: Option<usize>,
        /// Kind name.
        kind: String,
    },

    /// A record decoded but failed its own validation.
    #[error("entity #{entity}: invalid {kind} record: {}", messages.join("; "))]
    InvalidRecord {
        /// Index of the entity in the scenario.
        entity: usize,
        /// Kind name.
        kind: String,
        /// Validation messages.
        messages: Vec<String>,
    },

    /// A unit name is not in the built-in catalog.
    #[error("unknown unit {unit}")]
    UnknownUnit {
        /// The name looked up.
        unit: String,
    },

    /// Unit parameters did not match the unit's schema.
    #[error("invalid params for unit {unit}: {source}")]
    UnitParams {
        /// Catalog name of the unit.
        unit: String,
        /// The underlying decode error.
        source: serde_json::Error,
    },

    /// A unit refers to an action missing from the action table.
    #[error("unit {unit} refers to unregistered action {action}")]
    UnknownAction {
        /// Unit instance name.
        unit: String,
        /// The missing action.
        action: String,
    },

    /// Two actions share an id.
    #[error("action {action} is listed more than once")]
    DuplicateAction {
        /// The repeated id.
        action: String,
    },

    /// A modifier name is not in the built-in catalog.
    #[error("unknown signal modifier {modifier}")]
    UnknownModifier {
        /// The name looked up.
        modifier: String,
    },

    /// Seeding the store failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },

    /// Assembling the simulation failed.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying simulation error.
        #[from]
        source: SimulationError,
    },
}

impl From<serde_yml::Error> for ScenarioError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level error for the `cadence` binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The scenario failed to load or validate.
    #[error("scenario error: {source}")]
    Scenario {
        /// The underlying scenario error.
        #[from]
        source: ScenarioError,
    },

    /// Loading or restoring a snapshot failed.
    #[error("checkpoint error: {source}")]
    Checkpoint {
        /// The underlying checkpoint error.
        #[from]
        source: CheckpointError,
    },

    /// Restoring into the simulation failed.
    #[error("simulation error: {source}")]
    Simulation {
        /// The underlying simulation error.
        #[from]
        source: SimulationError,
    },

    /// The run loop failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: RunnerError,
    },

    /// The telemetry file could not be opened.
    #[error("telemetry error: {source}")]
    Telemetry {
        /// The underlying telemetry error.
        #[from]
        source: TelemetryError,
    },

    /// A resume directory holds no checkpoint files.
    #[error("no checkpoint found in {}", directory.display())]
    NoCheckpoint {
        /// The directory searched.
        directory: PathBuf,
    },

    /// Logging could not be initialized.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
