//! Records of the structured, append-only telemetry stream.
//!
//! The core emits one [`TelemetryRecord`] per published event and per
//! reported [`Fault`]. An external collaborator consumes the stream; the
//! core itself performs no aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::fault::Fault;
use crate::ids::EntityId;

/// Whether a record carries an ordinary event or a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// A published bus event.
    Event,
    /// A fault caught at the scheduler or bus boundary.
    Error,
}

/// One entry of the telemetry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Position in the stream, assigned by the emitter.
    pub seq: u64,
    /// Tick the record belongs to.
    pub tick: u64,
    /// Entity the record concerns, when known.
    pub entity_id: Option<EntityId>,
    /// Event name, or the fault kind for errors.
    pub event_name: String,
    /// Event or error tag.
    pub kind: TelemetryKind,
    /// Event payload or serialized fault.
    pub data: Value,
    /// Wall-clock time of emission.
    pub recorded_at: DateTime<Utc>,
}

impl TelemetryRecord {
    /// Build a record for a published event.
    pub fn event(seq: u64, tick: u64, event: &Event) -> Self {
        Self {
            seq,
            tick,
            entity_id: event.entity_id(),
            event_name: event.name().to_owned(),
            kind: TelemetryKind::Event,
            data: event.to_value(),
            recorded_at: Utc::now(),
        }
    }

    /// Build a record for a reported fault.
    pub fn fault(seq: u64, fault: &Fault) -> Self {
        Self {
            seq,
            tick: fault.tick(),
            entity_id: fault.entity_id(),
            event_name: fault.kind().to_owned(),
            kind: TelemetryKind::Error,
            data: serde_json::to_value(fault).unwrap_or(Value::Null),
            recorded_at: Utc::now(),
        }
    }

    /// Whether this record is tagged as an error.
    pub fn is_error(&self) -> bool {
        self.kind == TelemetryKind::Error
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::data_from;

    #[test]
    fn event_record_copies_entity_and_name() {
        let event = Event::new("action_chosen", data_from(json!({"entity_id": 4})));
        let record = TelemetryRecord::event(1, 10, &event);
        assert_eq!(record.entity_id, Some(EntityId::new(4)));
        assert_eq!(record.event_name, "action_chosen");
        assert!(!record.is_error());
    }

    #[test]
    fn fault_record_is_tagged_as_error() {
        let fault = Fault::UnmatchedOutcome {
            entity_id: EntityId::new(2),
            tick: 3,
        };
        let record = TelemetryRecord::fault(7, &fault);
        assert!(record.is_error());
        assert_eq!(record.tick, 3);
        assert_eq!(record.event_name, "unmatched_outcome");
        assert_eq!(record.data["kind"], "unmatched_outcome");
    }

    #[test]
    fn record_fields_serialize_in_camel_case() {
        let event = Event::new("action_chosen", data_from(json!({"entity_id": 4})));
        let value = serde_json::to_value(TelemetryRecord::event(2, 6, &event)).unwrap();
        assert_eq!(value["entityId"], 4);
        assert_eq!(value["eventName"], "action_chosen");
        assert_eq!(value["kind"], "event");
        assert!(value.get("recordedAt").is_some());
        assert!(value.get("event_name").is_none());
    }
}
