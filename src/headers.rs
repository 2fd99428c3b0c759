// src/headers.rs
// Transport header translation.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::brokers::errors::{BrokerError, Result};

/// Normalized, string-keyed transport headers.
pub type HeaderMap = BTreeMap<String, Value>;

/// Headers as a caller supplies them.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageHeaders {
    /// Already normalized; copied verbatim.
    Map(HeaderMap),
    /// A structured record whose fields become individual headers.
    Record(Map<String, Value>),
}

impl MessageHeaders {
    /// Reflects a serializable record field-by-field.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(fields) => Ok(MessageHeaders::Record(fields)),
            other => Err(BrokerError::InvalidConfiguration(format!(
                "headers must be a record with named fields, got {}",
                other
            ))),
        }
    }

    /// Translates into the normalized mapping sent with the message.
    pub fn translate(self) -> HeaderMap {
        match self {
            MessageHeaders::Map(map) => map,
            MessageHeaders::Record(fields) => fields.into_iter().collect(),
        }
    }
}

impl From<HeaderMap> for MessageHeaders {
    fn from(map: HeaderMap) -> Self {
        MessageHeaders::Map(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MessageHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MessageHeaders::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// `None` means "no headers".
pub fn translate_headers(headers: Option<MessageHeaders>) -> Option<HeaderMap> {
    headers.map(MessageHeaders::translate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct TraceHeaders {
        tenant: String,
        attempt: u32,
        origin: Option<String>,
    }

    #[test]
    fn test_map_is_copied_verbatim() {
        let headers: MessageHeaders = vec![("tenant", json!("acme")), ("attempt", json!(2))]
            .into_iter()
            .collect();
        let map = translate_headers(Some(headers)).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map["tenant"], json!("acme"));
        assert_eq!(map["attempt"], json!(2));
    }

    #[test]
    fn test_record_fields_become_headers() {
        let record = TraceHeaders {
            tenant: "acme".to_string(),
            attempt: 3,
            origin: None,
        };
        let map = MessageHeaders::from_record(&record).unwrap().translate();

        assert_eq!(map["tenant"], json!("acme"));
        assert_eq!(map["attempt"], json!(3));
        assert_eq!(map["origin"], Value::Null);
    }

    #[test]
    fn test_non_record_is_rejected() {
        assert!(MessageHeaders::from_record(&42).is_err());
        assert!(translate_headers(None).is_none());
    }
}
