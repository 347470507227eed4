//! Error types for the state store.
//!
//! Store errors indicate that the world model itself is inconsistent.
//! They are never recovered locally: callers propagate them to the
//! orchestrator, which halts the run.

use cadence_types::EntityId;

/// Errors raised by [`StateStore`](crate::StateStore) and
/// [`RecordRegistry`](crate::RecordRegistry) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The entity does not exist (never created, or destroyed).
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// An explicit identifier was requested that has already been issued.
    #[error("entity id {0} was already issued in this run")]
    EntityIdReused(EntityId),

    /// The entity identifier space is exhausted.
    #[error("entity id space exhausted")]
    IdSpaceExhausted,

    /// A record kind name has no registered decoder.
    #[error("unknown record kind: {kind}")]
    UnknownRecordKind {
        /// The kind name that was looked up.
        kind: String,
    },

    /// Record data could not be decoded into its registered type.
    #[error("failed to decode record of kind {kind}: {source}")]
    Decode {
        /// Kind being decoded.
        kind: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A record could not be serialized.
    #[error("failed to encode record of kind {kind}: {source}")]
    Encode {
        /// Kind being encoded.
        kind: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}
