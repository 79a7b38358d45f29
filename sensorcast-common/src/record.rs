use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single sensor message as relayed to viewers.
///
/// The payload is the message body decoded as text. The relay never looks
/// inside it; on the wire it is carried under the `value` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// ISO-8601 UTC receive time (e.g. "2024-05-01T12:00:00.123Z").
    pub timestamp: String,

    /// Raw message body.
    #[serde(rename = "value")]
    pub payload: String,
}

impl Record {
    /// Create a new record stamped with the current time.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp_iso(),
            payload: payload.into(),
        }
    }

    /// Create a record with an explicit timestamp.
    pub fn with_timestamp(timestamp: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            payload: payload.into(),
        }
    }

    /// Interpret the payload the way the dashboard does.
    ///
    /// Returns the parsed JSON document when the payload is valid JSON,
    /// otherwise the payload as a plain JSON string. Delivery never depends
    /// on this; the wire format always carries the payload as a string.
    pub fn expanded_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| serde_json::Value::String(self.payload.clone()))
    }
}

/// Get the current UTC time as an ISO-8601 string with millisecond precision.
pub fn current_timestamp_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
