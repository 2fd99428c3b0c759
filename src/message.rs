// src/message.rs
// Outbound payloads and their byte encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::brokers::errors::Result;

pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message body before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent as its UTF-8 bytes, untouched.
    Text(String),
    /// Encoded as JSON.
    Structured(Value),
}

impl Payload {
    pub fn json<T: Serialize>(message: &T) -> Result<Self> {
        Ok(Payload::Structured(serde_json::to_value(message)?))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Text(_) => TEXT_CONTENT_TYPE,
            Payload::Structured(_) => JSON_CONTENT_TYPE,
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&String> for Payload {
    fn from(text: &String) -> Self {
        Payload::Text(text.clone())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

/// Turns payloads into bytes. Null object fields are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec {
    pretty: bool,
}

impl MessageCodec {
    /// Compact output; use `pretty` only while debugging.
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    pub fn encode(&self, payload: &Payload) -> Result<Vec<u8>> {
        match payload {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Structured(value) => {
                let value = strip_nulls(value.clone());
                let bytes = if self.pretty {
                    serde_json::to_vec_pretty(&value)?
                } else {
                    serde_json::to_vec(&value)?
                };
                Ok(bytes)
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}
