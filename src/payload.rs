use crate::error::PublishError;
use crate::generator::FieldValue;
use bytes::Bytes;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata key carrying the device name
pub const DEVICE_KEY: &str = "device";
/// Metadata key carrying the generation time in Unix milliseconds
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Field names a profile may not use
pub const RESERVED_KEYS: [&str; 2] = [DEVICE_KEY, TIMESTAMP_KEY];

/// One tick's message body
///
/// Serializes as a flat JSON object: metadata first, then the profile's
/// static root keys, then the generated fields in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    device: String,
    timestamp_ms: u64,
    root: Map<String, Value>,
    fields: Vec<(String, FieldValue)>,
}

impl Payload {
    #[must_use]
    pub fn new(
        device: impl Into<String>,
        timestamp_ms: u64,
        root: Map<String, Value>,
        fields: Vec<(String, FieldValue)>,
    ) -> Self {
        Self {
            device: device.into(),
            timestamp_ms,
            root,
            fields,
        }
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    #[must_use]
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Looks up a generated field by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find_map(|(key, value)| (key == name).then_some(value))
    }

    /// Serializes to the JSON bytes that go on the wire
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Serialize` if encoding fails
    pub fn to_bytes(&self) -> Result<Bytes, PublishError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| PublishError::Serialize(e.to_string()))
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.root.len() + self.fields.len()))?;
        map.serialize_entry(DEVICE_KEY, &self.device)?;
        map.serialize_entry(TIMESTAMP_KEY, &self.timestamp_ms)?;
        for (key, value) in &self.root {
            map.serialize_entry(key, value)?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Current wall clock time in Unix milliseconds
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
