//! Payload encoding for requests and responses
//!
//! The dispatcher only ever talks to a [`Serializer`]; per-endpoint request
//! builders hand it opaque JSON values.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

/// Which reserved-key checks to skip when decoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionBypass {
    /// Reject both `__proto__` and `constructor.prototype` keys
    #[default]
    None,
    Proto,
    Constructor,
    All,
}

impl ProtectionBypass {
    fn checks_proto(&self) -> bool {
        matches!(self, ProtectionBypass::None | ProtectionBypass::Constructor)
    }

    fn checks_constructor(&self) -> bool {
        matches!(self, ProtectionBypass::None | ProtectionBypass::Proto)
    }
}

/// Encoding contract between the dispatcher and payloads
pub trait Serializer: Send + Sync {
    /// Encode one value as JSON text
    fn serialize(&self, value: &Value) -> Result<String>;

    /// Decode JSON text
    fn deserialize(&self, text: &str) -> Result<Value>;

    /// Encode a list as newline-delimited JSON; strings are taken verbatim
    fn ndserialize(&self, items: &[Value]) -> Result<String>;

    /// Encode query parameters; nulls are dropped and arrays comma-joined
    fn qserialize(&self, params: &Map<String, Value>) -> String;
}

/// Default JSON serializer
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    bypass: ProtectionBypass,
}

impl JsonSerializer {
    pub fn new(bypass: ProtectionBypass) -> Self {
        Self { bypass }
    }

    fn check_reserved_keys(&self, value: &Value) -> Result<()> {
        match value {
            Value::Object(map) => {
                if self.bypass.checks_proto() && map.contains_key("__proto__") {
                    return Err(TransportError::Deserialization(
                        "Object contains forbidden prototype property".to_string(),
                    ));
                }
                if self.bypass.checks_constructor() {
                    if let Some(Value::Object(ctor)) = map.get("constructor") {
                        if ctor.contains_key("prototype") {
                            return Err(TransportError::Deserialization(
                                "Object contains forbidden constructor property".to_string(),
                            ));
                        }
                    }
                }
                map.values().try_for_each(|v| self.check_reserved_keys(v))
            }
            Value::Array(items) => items.iter().try_for_each(|v| self.check_reserved_keys(v)),
            _ => Ok(()),
        }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<String> {
        trace!("Serializing {}", value);
        serde_json::to_string(value).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    fn deserialize(&self, text: &str) -> Result<Value> {
        trace!("Deserializing {} bytes", text.len());
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Deserialization(e.to_string()))?;
        if self.bypass != ProtectionBypass::All {
            self.check_reserved_keys(&value)?;
        }
        Ok(value)
    }

    fn ndserialize(&self, items: &[Value]) -> Result<String> {
        let mut ndjson = String::new();
        for item in items {
            match item {
                Value::String(raw) => ndjson.push_str(raw),
                other => ndjson.push_str(&self.serialize(other)?),
            }
            ndjson.push('\n');
        }
        Ok(ndjson)
    }

    fn qserialize(&self, params: &Map<String, Value>) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            let encoded = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                other => scalar_to_string(other),
            };
            query.append_pair(key, &encoded);
        }
        query.finish()
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
