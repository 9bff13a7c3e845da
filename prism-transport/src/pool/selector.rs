//! Node filtering and selection strategies

use crate::node::Node;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Configurable selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// Stable rotation across calls
    #[default]
    RoundRobin,
    /// Uniform, independent pick per call
    Random,
}

/// Picks one node among the filtered candidates
#[derive(Clone, Default)]
pub enum Selector {
    #[default]
    RoundRobin,
    Random,
    /// Returns an index into the candidate slice; out of range picks are clamped
    Custom(Arc<dyn Fn(&[Node]) -> usize + Send + Sync>),
}

impl Selector {
    pub(crate) fn select<'a>(&self, candidates: &'a [Node], cursor: &AtomicUsize) -> Option<&'a Node> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self {
            Selector::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            Selector::Random => rand::thread_rng().gen_range(0..candidates.len()),
            Selector::Custom(pick) => pick(candidates).min(candidates.len() - 1),
        };
        candidates.get(index)
    }
}

impl From<SelectorKind> for Selector {
    fn from(kind: SelectorKind) -> Self {
        match kind {
            SelectorKind::RoundRobin => Selector::RoundRobin,
            SelectorKind::Random => Selector::Random,
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::RoundRobin => write!(f, "RoundRobin"),
            Selector::Random => write!(f, "Random"),
            Selector::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Decides which nodes may receive a request
#[derive(Clone, Default)]
pub enum NodeFilter {
    /// Skip dedicated master nodes
    #[default]
    Default,
    /// Every node is a candidate
    All,
    Custom(Arc<dyn Fn(&Node) -> bool + Send + Sync>),
}

impl NodeFilter {
    pub fn accepts(&self, node: &Node) -> bool {
        match self {
            NodeFilter::Default => !node.roles().is_some_and(|r| r.is_master_only()),
            NodeFilter::All => true,
            NodeFilter::Custom(filter) => filter(node),
        }
    }
}

impl fmt::Debug for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeFilter::Default => write!(f, "Default"),
            NodeFilter::All => write!(f, "All"),
            NodeFilter::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Per-call selection options
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub filter: NodeFilter,
    pub selector: Selector,
}

impl SelectOptions {
    pub fn new(filter: NodeFilter, selector: Selector) -> Self {
        Self { filter, selector }
    }

    pub fn with_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }
}
