//! Reported, non-fatal conditions.
//!
//! A [`Fault`] is caught at the scheduler or bus boundary, recorded with
//! its full context and surfaced through the telemetry stream tagged as an
//! error. None of these abort a tick. Conditions that mean the world model
//! itself is inconsistent are not faults: they are typed errors returned
//! to the orchestrator.

use serde::{Deserialize, Serialize};

use crate::ids::{ActionKey, EntityId};

/// A condition that was caught, reported and survived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// A unit's `update` (or `resume`) returned an error.
    #[error("unit {unit} failed at tick {tick}: {cause}")]
    UnitFailure {
        /// Registered unit name.
        unit: String,
        /// Tick during which the failure happened.
        tick: u64,
        /// Rendered error.
        cause: String,
    },

    /// A unit's awaited external call exceeded its soft timeout.
    #[error("unit {unit} timed out at tick {tick} after {timeout_ms}ms")]
    UnitTimeout {
        /// Registered unit name.
        unit: String,
        /// Tick whose turn was abandoned.
        tick: u64,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A unit failed on too many consecutive ticks and was demoted.
    #[error("unit {unit} disabled at tick {tick} after {consecutive_failures} consecutive failing ticks")]
    UnitDisabled {
        /// Registered unit name.
        unit: String,
        /// Tick at which the unit was disabled.
        tick: u64,
        /// Number of consecutive failing ticks that triggered demotion.
        consecutive_failures: u32,
    },

    /// An event handler returned an error.
    #[error("handler {handler} for event {event} failed at tick {tick}: {cause}")]
    HandlerFailure {
        /// Event being delivered.
        event: String,
        /// Name the handler subscribed under.
        handler: String,
        /// Tick during which the delivery happened.
        tick: u64,
        /// Rendered error.
        cause: String,
    },

    /// A publish was refused because nesting exceeded the configured depth.
    #[error("publish of {event} at tick {tick} refused at depth {depth} (limit {limit})")]
    ReentrancyLimit {
        /// Event whose publish was refused.
        event: String,
        /// Tick during which the publish happened.
        tick: u64,
        /// Nesting depth at the time of the publish.
        depth: usize,
        /// Configured maximum depth.
        limit: usize,
    },

    /// An entity proposed a second action within one tick.
    #[error("entity {entity_id} already proposed an action at tick {tick}; rejected {action}")]
    DuplicateProposal {
        /// Proposing entity.
        entity_id: EntityId,
        /// Tick of both proposals.
        tick: u64,
        /// Action identifier of the rejected proposal.
        action: String,
    },

    /// A second outcome arrived for an action that already had one.
    #[error("action {key} for entity {entity_id} already has an outcome at tick {tick}")]
    DuplicateResolution {
        /// Acting entity.
        entity_id: EntityId,
        /// Tick of the rejected outcome.
        tick: u64,
        /// Action instance the outcome referred to.
        key: ActionKey,
    },

    /// An outcome arrived that matches no action in flight.
    #[error("outcome for entity {entity_id} at tick {tick} matches no action in flight")]
    UnmatchedOutcome {
        /// Entity named by the outcome.
        entity_id: EntityId,
        /// Tick of the outcome.
        tick: u64,
    },

    /// No subscriber produced an outcome for a dispatched action before
    /// the tick ended.
    #[error("action {action} ({key}) for entity {entity_id} unresolved at end of tick {tick} ({subscribers} subscribers)")]
    ActionDispatchTimeout {
        /// Acting entity.
        entity_id: EntityId,
        /// Tick the action was proposed in.
        tick: u64,
        /// Action identifier.
        action: String,
        /// Action instance.
        key: ActionKey,
        /// Number of handlers subscribed to the dispatch event.
        subscribers: usize,
    },

    /// An action was still unresolved when the run shut down.
    #[error("action {action} ({key}) for entity {entity_id} cancelled by shutdown at tick {tick}")]
    ActionCancelled {
        /// Acting entity.
        entity_id: EntityId,
        /// Tick the action was proposed in.
        tick: u64,
        /// Action identifier.
        action: String,
        /// Action instance.
        key: ActionKey,
    },
}

impl Fault {
    /// Snake-case name used as the telemetry event name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnitFailure { .. } => "unit_failure",
            Self::UnitTimeout { .. } => "unit_timeout",
            Self::UnitDisabled { .. } => "unit_disabled",
            Self::HandlerFailure { .. } => "handler_failure",
            Self::ReentrancyLimit { .. } => "reentrancy_limit",
            Self::DuplicateProposal { .. } => "duplicate_proposal",
            Self::DuplicateResolution { .. } => "duplicate_resolution",
            Self::UnmatchedOutcome { .. } => "unmatched_outcome",
            Self::ActionDispatchTimeout { .. } => "action_dispatch_timeout",
            Self::ActionCancelled { .. } => "action_cancelled",
        }
    }

    /// Tick the fault belongs to.
    pub const fn tick(&self) -> u64 {
        match self {
            Self::UnitFailure { tick, .. }
            | Self::UnitTimeout { tick, .. }
            | Self::UnitDisabled { tick, .. }
            | Self::HandlerFailure { tick, .. }
            | Self::ReentrancyLimit { tick, .. }
            | Self::DuplicateProposal { tick, .. }
            | Self::DuplicateResolution { tick, .. }
            | Self::UnmatchedOutcome { tick, .. }
            | Self::ActionDispatchTimeout { tick, .. }
            | Self::ActionCancelled { tick, .. } => *tick,
        }
    }

    /// Entity the fault concerns, for action-related faults.
    pub const fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::DuplicateProposal { entity_id, .. }
            | Self::DuplicateResolution { entity_id, .. }
            | Self::UnmatchedOutcome { entity_id, .. }
            | Self::ActionDispatchTimeout { entity_id, .. }
            | Self::ActionCancelled { entity_id, .. } => Some(*entity_id),
            Self::UnitFailure { .. }
            | Self::UnitTimeout { .. }
            | Self::UnitDisabled { .. }
            | Self::HandlerFailure { .. }
            | Self::ReentrancyLimit { .. } => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let fault = Fault::DuplicateProposal {
            entity_id: EntityId::new(1),
            tick: 5,
            action: "move".to_owned(),
        };
        let value = serde_json::to_value(&fault).unwrap();
        assert_eq!(value["kind"], "duplicate_proposal");
        assert_eq!(value["entity_id"], 1);
        assert_eq!(fault.kind(), "duplicate_proposal");
        assert_eq!(fault.tick(), 5);
        assert_eq!(fault.entity_id(), Some(EntityId::new(1)));
    }

    #[test]
    fn unit_faults_have_no_entity() {
        let fault = Fault::UnitTimeout {
            unit: "oracle".to_owned(),
            tick: 2,
            timeout_ms: 50,
        };
        assert_eq!(fault.entity_id(), None);
        assert!(fault.to_string().contains("oracle"));
    }

    #[test]
    fn shutdown_cancellation_is_not_a_timeout() {
        let fault = Fault::ActionCancelled {
            entity_id: EntityId::new(4),
            tick: 9,
            action: "rest".to_owned(),
            key: ActionKey::new(2),
        };
        let value = serde_json::to_value(&fault).unwrap();
        assert_eq!(value["kind"], "action_cancelled");
        assert_eq!(fault.kind(), "action_cancelled");
        assert_eq!(fault.tick(), 9);
        assert_eq!(fault.entity_id(), Some(EntityId::new(4)));
        assert!(fault.to_string().contains("shutdown"));
    }
}
