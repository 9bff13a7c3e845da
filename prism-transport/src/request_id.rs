//! Correlation ids for logical requests

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation id shared by every notification of one logical request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::Text(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::Text(id)
    }
}

/// Source of correlation ids for requests that do not bring their own
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> RequestId;
}

/// Increasing integers starting at 1
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Start counting from 1 again
    pub fn reset(&self) {
        self.next.store(1, Ordering::SeqCst);
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.next_id(), RequestId::Number(1));
        assert_eq!(ids.next_id(), RequestId::Number(2));
        ids.reset();
        assert_eq!(ids.next_id(), RequestId::Number(1));
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let ids = Arc::new(SequentialIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..100).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<RequestId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_by_key(|id| id.to_string().parse::<u64>().unwrap());
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(RequestId::from(7).to_string(), "7");
        assert_eq!(RequestId::from("abc").to_string(), "abc");
        assert_eq!(serde_json::to_string(&RequestId::from(7)).unwrap(), "7");
        assert_eq!(
            serde_json::from_str::<RequestId>("\"abc\"").unwrap(),
            RequestId::Text("abc".into())
        );
    }
}
