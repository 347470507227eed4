//! Error types for event handlers and telemetry sinks.

use cadence_store::StoreError;

/// Error returned by an event handler.
///
/// [`BusError::Store`] is treated as fatal for the run: the bus stops
/// delivering and hands the store error back to the orchestrator. Every
/// other variant is caught, reported as a handler fault and survived.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The event payload was missing a field or had the wrong shape.
    #[error("malformed payload for {event}: {reason}")]
    Payload {
        /// Event whose payload was rejected.
        event: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A state store operation failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: cadence_store::StoreError,
    },

    /// Any other handler failure.
    #[error("{0}")]
    Handler(String),
}

impl BusError {
    /// Shorthand for a [`BusError::Payload`].
    pub fn payload(event: &str, reason: impl Into<String>) -> Self {
        Self::Payload {
            event: event.to_owned(),
            reason: reason.into(),
        }
    }

    /// The store error carried by a [`BusError::Store`], if any.
    pub fn into_store(self) -> Result<StoreError, Self> {
        match self {
            Self::Store { source } => Ok(source),
            other => Err(other),
        }
    }
}

/// Error raised by a telemetry sink.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Writing to the sink failed.
    #[error("telemetry I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("telemetry encoding error: {source}")]
    Encode {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}
