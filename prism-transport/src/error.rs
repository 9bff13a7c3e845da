//! Transport error types

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the node pool, the dispatcher and the helpers
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Caller misuse: invalid input, missing field, use after stop
    #[error("{0}")]
    Configuration(String),

    #[error("Node with id '{0}' is already present")]
    DuplicateNode(String),

    #[error("There are no living connections")]
    NoLivingConnections,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// A valid HTTP exchange that ended with a non-2xx status
    #[error("Response error ({status}): {reason}")]
    Response {
        status: u16,
        reason: String,
        body: Value,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            TransportError::Configuration(_) => "configuration",
            TransportError::DuplicateNode(_) => "duplicate_node",
            TransportError::NoLivingConnections => "no_living_connections",
            TransportError::Connection(_) => "connection",
            TransportError::Timeout(_) => "timeout",
            TransportError::Response { .. } => "response",
            TransportError::Serialization(_) => "serialization",
            TransportError::Deserialization(_) => "deserialization",
            TransportError::Other(_) => "other",
        }
    }

    /// Connectivity failures mark the node dead and are retried on another node
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Timeout(_)
        )
    }

    /// Build a response error, pulling the reason out of an error body when present
    pub fn response(status: u16, body: Value) -> Self {
        let reason = body
            .get("error")
            .and_then(|err| match err {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .unwrap_or_else(|| "Response Error".to_string());
        TransportError::Response {
            status,
            reason,
            body,
        }
    }

    /// HTTP status of a response error
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Deserialization(err.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(err: url::ParseError) -> Self {
        TransportError::Configuration(format!("Invalid URL: {}", err))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Connection(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_reason_from_error_type() {
        let err = TransportError::response(
            400,
            json!({"error": {"type": "parsing_exception", "reason": "bad"}}),
        );
        assert_eq!(err.status(), Some(400));
        assert_eq!(
            err.to_string(),
            "Response error (400): parsing_exception"
        );
    }

    #[test]
    fn test_response_reason_fallback() {
        let err = TransportError::response(500, json!({"status": 500}));
        assert_eq!(err.to_string(), "Response error (500): Response Error");
    }

    #[test]
    fn test_transport_failure_classification() {
        assert!(TransportError::Connection("refused".into()).is_transport_failure());
        assert!(TransportError::Timeout("slow".into()).is_transport_failure());
        assert!(!TransportError::NoLivingConnections.is_transport_failure());
        assert!(!TransportError::response(503, Value::Null).is_transport_failure());
    }
}
