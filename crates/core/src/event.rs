use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An immutable record flowing through the bus and, verbatim, over the
/// gateway wire: a dotted type name, an opaque JSON object payload, and the
/// emission timestamp (milliseconds since the epoch on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Payload field as a string, when present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Build an event payload from a `json!` literal. Object literals become the
/// payload directly; any other value is wrapped under a `"value"` key so the
/// payload stays an object on the wire.
pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_keeps_objects_and_wraps_scalars() {
        let obj = payload(json!({"name": "test"}));
        assert_eq!(obj.get("name"), Some(&json!("test")));

        let wrapped = payload(json!(42));
        assert_eq!(wrapped.get("value"), Some(&json!(42)));
    }

    #[test]
    fn event_serializes_with_numeric_timestamp() {
        let event = Event::new("chaos.file.created", payload(json!({"name": "test"})));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "chaos.file.created");
        assert_eq!(value["payload"]["name"], "test");
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn event_roundtrips_through_json() {
        let event = Event::new("system.started", payload(json!({"component": "hub"})));
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_type, event.event_type);
        assert_eq!(back.payload_str("component"), Some("hub"));
    }
}
