//! Control channel events
//!
//! Events are opaque JSON objects. The relay only cares about two keys: the
//! `type` discriminator and the `event_id`. Everything else is passed through
//! untouched so new server event types never need a code change here.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{RelayError, Result};

pub const CONVERSATION_ITEM_CREATE: &str = "conversation.item.create";
pub const RESPONSE_CREATE: &str = "response.create";

/// A single JSON event exchanged over the control channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    /// Creates an event carrying only a `type`.
    pub fn new(event_type: impl Into<String>) -> Event {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(event_type.into()));
        Event(fields)
    }

    /// Wraps an arbitrary JSON value. Only objects are events.
    pub fn from_value(value: Value) -> Result<Event> {
        match value {
            Value::Object(fields) => Ok(Event(fields)),
            other => Err(RelayError::InvalidEvent(format!(
                "expected a JSON object event, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parses a payload received on the control channel.
    pub fn parse(data: &[u8]) -> Result<Event> {
        let value: Value = serde_json::from_slice(data)?;
        Event::from_value(value)
    }

    /// A user text message for the conversation.
    pub fn conversation_item_create(text: &str) -> Event {
        let mut event = Event::new(CONVERSATION_ITEM_CREATE);
        event.insert(
            "item",
            json!({
                "type": "message",
                "role": "user",
                "content": [
                    {
                        "type": "input_text",
                        "text": text,
                    }
                ],
            }),
        );
        event
    }

    /// Asks the model to generate a response.
    pub fn response_create() -> Event {
        Event::new(RESPONSE_CREATE)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.0
            .get("event_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Assigns a fresh UUID as `event_id` unless a non-empty one is present.
    /// Returns the id the event ends up with.
    pub fn ensure_event_id(&mut self) -> &str {
        if self.event_id().is_none() {
            self.0.insert(
                "event_id".to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        self.event_id().unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Serializes to the single-line JSON sent on the wire.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.event_type().unwrap_or("<untyped>"),
            self.event_id().unwrap_or("-")
        )
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Event(fields)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
