//! Record type
//!
//! A record is one logical unit of sensor data: an ordered mapping from field
//! name to JSON value that carries a `timestamp` field by the time it reaches a
//! transport. Records are cheap to clone and serialize to a JSON object.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Name of the mandatory timestamp field
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Ordered field-name to value mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Create a record stamped with the current UTC time
    pub fn stamped() -> Self {
        let mut record = Self::new();
        record.stamp_now();
        record
    }

    /// Builder-style field insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a field, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Get a field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Check if a field exists
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrow the underlying map
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// The timestamp field, if present
    pub fn timestamp(&self) -> Option<&Value> {
        self.0.get(TIMESTAMP_FIELD)
    }

    /// Add a current UTC timestamp if the record has none.
    ///
    /// Returns true if a timestamp was added.
    pub fn stamp_now(&mut self) -> bool {
        if self.contains(TIMESTAMP_FIELD) {
            return false;
        }
        self.0
            .insert(TIMESTAMP_FIELD.to_string(), Value::String(now_timestamp()));
        true
    }

    /// Check the record is fit to hand to a transport.
    ///
    /// The timestamp must be present and either a Unix number or an ISO-8601
    /// string (with or without an offset).
    pub fn validate(&self) -> Result<()> {
        match self.timestamp() {
            None => Err(Error::InvalidRecord("missing `timestamp` field".into())),
            Some(Value::Number(_)) => Ok(()),
            Some(Value::String(s)) if is_iso8601(s) => Ok(()),
            Some(Value::String(s)) => Err(Error::InvalidRecord(format!(
                "timestamp `{}` is not ISO-8601",
                s
            ))),
            Some(other) => Err(Error::InvalidRecord(format!(
                "timestamp must be a string or number, got {}",
                other
            ))),
        }
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Validate then serialize into a wire payload
    pub fn to_payload(&self) -> Result<Bytes> {
        self.validate()?;
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }

    /// Parse a JSON object payload
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::try_from(value)
    }

    /// Parse a JSON object payload from raw bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)?;
        Self::try_from(value)
    }

    /// Consume into the underlying map
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidRecord(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

/// Current UTC time as an RFC 3339 string with microsecond precision
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn is_iso8601(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
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
