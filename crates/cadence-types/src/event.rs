//! Immutable named payloads exchanged over the event bus.
//!
//! An [`Event`] has no owner: it is a message, not a resource. Handlers
//! receive it by shared reference and cannot alter what sibling handlers
//! observe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EntityId;

/// Key under which events carry the entity they concern.
pub const ENTITY_ID_KEY: &str = "entity_id";

/// Mapping payload carried by every event.
pub type EventData = serde_json::Map<String, Value>;

/// Convert an arbitrary JSON value into event data.
///
/// Objects are used as-is; any other value is wrapped under a single
/// `"value"` key so that no payload is lost.
pub fn data_from(value: Value) -> EventData {
    match value {
        Value::Object(map) => map,
        Value::Null => EventData::new(),
        other => {
            let mut map = EventData::new();
            map.insert("value".to_owned(), other);
            map
        }
    }
}

/// A named, immutable payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    data: EventData,
}

impl Event {
    /// Create an event from its name and payload.
    pub fn new(name: impl Into<String>, data: EventData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// The event name subscribers registered for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The full payload.
    pub const fn data(&self) -> &EventData {
        &self.data
    }

    /// Look up one payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The entity this event concerns, if the payload names one under
    /// [`ENTITY_ID_KEY`].
    pub fn entity_id(&self) -> Option<EntityId> {
        self.data
            .get(ENTITY_ID_KEY)
            .and_then(Value::as_u64)
            .map(EntityId::new)
    }

    /// The payload as a JSON object value (cloned).
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_id_is_read_from_payload() {
        let event = Event::new("moved", data_from(json!({"entity_id": 9, "dx": 1})));
        assert_eq!(event.entity_id(), Some(EntityId::new(9)));
        assert_eq!(event.get("dx"), Some(&json!(1)));
    }

    #[test]
    fn missing_entity_id_is_none() {
        let event = Event::new("weather", data_from(json!({"rain": true})));
        assert_eq!(event.entity_id(), None);
    }

    #[test]
    fn scalar_payloads_are_wrapped() {
        let data = data_from(json!(3.5));
        assert_eq!(data.get("value"), Some(&json!(3.5)));
        assert!(data_from(Value::Null).is_empty());
    }
}
