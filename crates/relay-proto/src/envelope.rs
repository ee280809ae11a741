//! The untyped protocol message carried by every frame.
//!
//! The relay only ever inspects a handful of discriminator fields (`type`,
//! `action`, `targets`, `agent_id`); everything else travels through
//! unchanged. [`Envelope`] keeps the JSON object intact so forwarded commands
//! and relayed results reach the other side byte-for-byte equivalent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TYPE_FIELD: &str = "type";
pub const ACTION_FIELD: &str = "action";
pub const TARGETS_FIELD: &str = "targets";
pub const AGENT_ID_FIELD: &str = "agent_id";

/// One framed protocol message: always a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap an arbitrary JSON value, returning it back if it is not an object.
    ///
    /// # Errors
    ///
    /// Returns the original value when it is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, Value> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }

    /// Serialize a typed message into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the value fails to serialize or is not a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(serde::ser::Error::custom("envelope must be a JSON object")),
        }
    }

    /// Deserialize the envelope into a typed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the fields do not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    /// The `type` discriminator (role on first frames, result kind afterwards).
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get(TYPE_FIELD).and_then(Value::as_str)
    }

    /// The `action` discriminator.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.0.get(ACTION_FIELD).and_then(Value::as_str)
    }

    /// Target identities named by a control command. Non-string entries are skipped.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.0
            .get(TARGETS_FIELD)
            .and_then(Value::as_array)
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.0.get(AGENT_ID_FIELD).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Stamp the envelope with the identity of the endpoint that produced it.
    pub fn tag_agent(&mut self, identity: &str) {
        self.insert(AGENT_ID_FIELD, identity);
    }

    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
