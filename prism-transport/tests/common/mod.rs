//! Shared fixtures for transport integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use prism_transport::{
    Connection, ConnectionRequest, Node, NodeEvent, RawResponse, RequestEvent, ResponseEvent,
    Result, ResurrectEvent, SniffEvent, TransportObserver,
};
use std::sync::Arc;

type Handler = dyn Fn(&Node, &ConnectionRequest) -> Result<RawResponse> + Send + Sync;

/// Connection answering from a closure and recording every request
pub struct MockConnection {
    handler: Box<Handler>,
    log: Mutex<Vec<(String, ConnectionRequest)>>,
}

impl MockConnection {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Node, &ConnectionRequest) -> Result<RawResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        })
    }

    /// `(node id, request)` pairs in arrival order
    pub fn requests(&self) -> Vec<(String, ConnectionRequest)> {
        self.log.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.log.lock().len()
    }

    /// Requests for a path, ignoring health probes
    pub fn count_path(&self, path: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(_, r)| r.path.trim_start_matches('/') == path.trim_start_matches('/'))
            .count()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn request(&self, node: &Node, request: &ConnectionRequest) -> Result<RawResponse> {
        self.log
            .lock()
            .push((node.id().to_string(), request.clone()));
        (self.handler)(node, request)
    }
}

/// Observer keeping every event for later assertions
#[derive(Default)]
pub struct RecordingObserver {
    pub requests: Mutex<Vec<RequestEvent>>,
    pub responses: Mutex<Vec<ResponseEvent>>,
    pub sniffs: Mutex<Vec<SniffEvent>>,
    pub resurrects: Mutex<Vec<ResurrectEvent>>,
    pub dead: Mutex<Vec<NodeEvent>>,
    pub alive: Mutex<Vec<NodeEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TransportObserver for RecordingObserver {
    fn on_request(&self, event: &RequestEvent) {
        self.requests.lock().push(event.clone());
    }

    fn on_response(&self, event: &ResponseEvent) {
        self.responses.lock().push(event.clone());
    }

    fn on_sniff(&self, event: &SniffEvent) {
        self.sniffs.lock().push(event.clone());
    }

    fn on_resurrect(&self, event: &ResurrectEvent) {
        self.resurrects.lock().push(event.clone());
    }

    fn on_node_dead(&self, event: &NodeEvent) {
        self.dead.lock().push(event.clone());
    }

    fn on_node_alive(&self, event: &NodeEvent) {
        self.alive.lock().push(event.clone());
    }
}
