//! Typed payloads of the action events.
//!
//! Each payload converts to and from the [`EventData`] map carried by the
//! bus. Entity ids travel under `entity_id` so telemetry can attribute the
//! event.

use std::collections::BTreeMap;

use cadence_events::BusError;
use cadence_types::{ActionKey, EntityId, Event, EventData};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Proposal published by a decision unit as `action_chosen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Identifier of the chosen action.
    pub action: String,
    /// Free-form action parameters.
    #[serde(default)]
    pub params: Value,
}

impl ActionProposal {
    /// Propose `action` for `entity_id` with no parameters.
    pub fn new(entity_id: EntityId, action: impl Into<String>) -> Self {
        Self {
            entity_id,
            action: action.into(),
            params: Value::Null,
        }
    }

    /// Attach parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Request published as `execute_<action>_action` to the world-rule unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDispatch {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Key of the in-flight action; echo it in the outcome.
    pub key: ActionKey,
    /// Identifier of the action.
    pub action: String,
    /// Parameters from the proposal.
    #[serde(default)]
    pub params: Value,
    /// Tick of the proposal.
    pub tick: u64,
}

impl ActionDispatch {
    /// Build the outcome report answering this dispatch.
    pub fn outcome(&self, success: bool, signal: f64) -> OutcomeReport {
        OutcomeReport {
            entity_id: self.entity_id,
            key: Some(self.key),
            success,
            signal,
            details: Value::Null,
        }
    }
}

/// Outcome published by the world-rule unit as `action_outcome_ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReport {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Key of the in-flight action. Without it the entity's action of the
    /// current tick is assumed.
    #[serde(default)]
    pub key: Option<ActionKey>,
    /// Whether the action succeeded.
    pub success: bool,
    /// Base numeric signal before modifiers.
    #[serde(default)]
    pub signal: f64,
    /// Free-form outcome details.
    #[serde(default)]
    pub details: Value,
}

impl OutcomeReport {
    /// Attach outcome details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Terminal event published as `action_resolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAction {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Key of the resolved action.
    pub key: ActionKey,
    /// Identifier of the action.
    pub action: String,
    /// Parameters from the proposal.
    #[serde(default)]
    pub params: Value,
    /// Whether the action succeeded.
    pub success: bool,
    /// Signal reported by the world-rule unit.
    pub base_signal: f64,
    /// Signal after every modifier.
    pub signal: f64,
    /// Contribution of each modifier, by modifier name.
    #[serde(default)]
    pub breakdown: BTreeMap<String, f64>,
    /// Outcome details from the world-rule unit.
    #[serde(default)]
    pub details: Value,
    /// Tick of resolution.
    pub tick: u64,
}

/// Why an action ended without an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No world-rule unit produced an outcome within the tick.
    DispatchTimeout,
    /// The run shut down first.
    Shutdown,
}

/// Terminal event published as `action_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAction {
    /// Acting entity.
    pub entity_id: EntityId,
    /// Key of the failed action.
    pub key: ActionKey,
    /// Identifier of the action.
    pub action: String,
    /// Why it failed.
    pub reason: FailureReason,
    /// Tick of failure.
    pub tick: u64,
}

/// Conversion between a payload struct and bus event data.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Encode as event data.
    fn to_data(&self) -> Result<EventData, BusError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(BusError::Handler(format!(
                "payload encoded to a non-object value: {other}"
            ))),
            Err(e) => Err(BusError::Handler(format!("payload encoding failed: {e}"))),
        }
    }

    /// Decode from a received event.
    fn from_event(event: &Event) -> Result<Self, BusError> {
        serde_json::from_value(event.to_value()).map_err(|e| BusError::payload(event.name(), e.to_string()))
    }
}

impl EventPayload for ActionProposal {}
impl EventPayload for ActionDispatch {}
impl EventPayload for OutcomeReport {}
impl EventPayload for ResolvedAction {}
impl EventPayload for FailedAction {}
