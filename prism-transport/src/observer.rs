//! Lifecycle notifications
//!
//! Observers are registered when the transport is built and are called
//! synchronously from the request path, so implementations must not block.
//! Every event carries the [`RequestMeta`] of the logical request that caused
//! it, which ties retries, sniffs and resurrections to one correlation id.

use crate::error::TransportError;
use crate::node::Node;
use crate::pool::ResurrectStrategy;
use crate::request_id::RequestId;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata of one logical request
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: RequestId,
    /// Caller context, or the transport default
    pub context: Option<Value>,
    /// Client name of the transport that issued the request
    pub name: String,
    /// Node of the current attempt
    pub node: Option<Node>,
    /// Retries performed so far
    pub attempts: u32,
}

impl RequestMeta {
    pub fn new(id: RequestId, context: Option<Value>, name: impl Into<String>) -> Self {
        Self {
            id,
            context,
            name: name.into(),
            node: None,
            attempts: 0,
        }
    }
}

/// Why a sniff was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffReason {
    Start,
    Interval,
    ConnectionFault,
    /// Explicit call to [`Transport::sniff`](crate::Transport::sniff)
    Manual,
}

impl SniffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SniffReason::Start => "start",
            SniffReason::Interval => "interval",
            SniffReason::ConnectionFault => "connection_fault",
            SniffReason::Manual => "manual",
        }
    }
}

/// Emitted before every attempt, and once with an error when no node is available
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub meta: RequestMeta,
    pub method: Method,
    pub path: String,
    pub querystring: String,
    pub error: Option<TransportError>,
}

/// Emitted exactly once per logical request
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub meta: RequestMeta,
    pub status: Option<u16>,
    pub error: Option<TransportError>,
}

#[derive(Debug, Clone)]
pub struct SniffEvent {
    pub meta: RequestMeta,
    pub reason: SniffReason,
    /// Node ids after the sync; empty when the sniff failed
    pub nodes: Vec<String>,
    pub error: Option<TransportError>,
}

#[derive(Debug, Clone)]
pub struct ResurrectEvent {
    pub meta: RequestMeta,
    pub strategy: ResurrectStrategy,
    pub node: Node,
    pub is_alive: bool,
}

/// A node changed health status during a request
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub meta: RequestMeta,
    pub node: Node,
    /// Failure that marked the node dead
    pub error: Option<TransportError>,
}

/// Receives transport notifications; every method defaults to a no-op
pub trait TransportObserver: Send + Sync {
    fn on_request(&self, _event: &RequestEvent) {}

    fn on_response(&self, _event: &ResponseEvent) {}

    fn on_sniff(&self, _event: &SniffEvent) {}

    fn on_resurrect(&self, _event: &ResurrectEvent) {}

    fn on_node_dead(&self, _event: &NodeEvent) {}

    fn on_node_alive(&self, _event: &NodeEvent) {}
}

/// Fan-out over the registered observers
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn TransportObserver>>,
}

impl Observers {
    pub fn new(observers: Vec<Arc<dyn TransportObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn TransportObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn request(&self, event: &RequestEvent) {
        self.observers.iter().for_each(|o| o.on_request(event));
    }

    pub(crate) fn response(&self, event: &ResponseEvent) {
        self.observers.iter().for_each(|o| o.on_response(event));
    }

    pub(crate) fn sniff(&self, event: &SniffEvent) {
        self.observers.iter().for_each(|o| o.on_sniff(event));
    }

    pub(crate) fn resurrect(&self, event: &ResurrectEvent) {
        self.observers.iter().for_each(|o| o.on_resurrect(event));
    }

    pub(crate) fn node_dead(&self, event: &NodeEvent) {
        self.observers.iter().for_each(|o| o.on_node_dead(event));
    }

    pub(crate) fn node_alive(&self, event: &NodeEvent) {
        self.observers.iter().for_each(|o| o.on_node_alive(event));
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}

/// Logs every notification through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TransportObserver for TracingObserver {
    fn on_request(&self, event: &RequestEvent) {
        let node = event.meta.node.as_ref().map(Node::id).unwrap_or("-");
        match &event.error {
            Some(error) => warn!(
                request_id = %event.meta.id,
                client = %event.meta.name,
                method = %event.method,
                path = %event.path,
                error = %error,
                "Request could not be sent"
            ),
            None => debug!(
                request_id = %event.meta.id,
                client = %event.meta.name,
                node = %node,
                attempt = event.meta.attempts,
                method = %event.method,
                path = %event.path,
                "Request"
            ),
        }
    }

    fn on_response(&self, event: &ResponseEvent) {
        match &event.error {
            Some(error) => warn!(
                request_id = %event.meta.id,
                client = %event.meta.name,
                status = ?event.status,
                attempts = event.meta.attempts,
                error = %error,
                "Request failed"
            ),
            None => debug!(
                request_id = %event.meta.id,
                client = %event.meta.name,
                status = ?event.status,
                attempts = event.meta.attempts,
                "Response"
            ),
        }
    }

    fn on_sniff(&self, event: &SniffEvent) {
        match &event.error {
            Some(error) => warn!(
                request_id = %event.meta.id,
                reason = event.reason.as_str(),
                error = %error,
                "Sniff failed"
            ),
            None => info!(
                request_id = %event.meta.id,
                reason = event.reason.as_str(),
                nodes = event.nodes.len(),
                "Sniff completed"
            ),
        }
    }

    fn on_resurrect(&self, event: &ResurrectEvent) {
        info!(
            request_id = %event.meta.id,
            client = %event.meta.name,
            node = %event.node.id(),
            strategy = event.strategy.as_str(),
            is_alive = event.is_alive,
            "Resurrect"
        );
    }

    fn on_node_dead(&self, event: &NodeEvent) {
        warn!(
            request_id = %event.meta.id,
            node = %event.node.id(),
            dead_count = event.node.dead_count(),
            "Node dead"
        );
    }

    fn on_node_alive(&self, event: &NodeEvent) {
        info!(request_id = %event.meta.id, node = %event.node.id(), "Node alive");
    }
}
