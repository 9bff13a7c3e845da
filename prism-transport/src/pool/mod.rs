//! Node registry
//!
//! Owns every known [`Node`], the dead queue and the selection logic.
//!
//! # Architecture
//!
//! - **Registry**: ordered node list (insertion order drives round-robin)
//! - **Dead queue**: ids of dead nodes sorted by resurrect timeout
//! - **Selection**: filter + selector over alive nodes, dead nodes as last resort
//! - **Resurrection**: ping / optimistic / none, see [`ResurrectStrategy`]
//! - **Topology sync**: [`NodePool::update`] reconciles a sniffed node list
//!
//! All mutations take the write lock, so the dead queue is never observed
//! half-sorted. The lock is never held across an await.

mod resurrect;
mod selector;
mod topology;

pub use resurrect::{ResurrectOutcome, ResurrectStrategy};
pub use selector::{NodeFilter, SelectOptions, Selector, SelectorKind};
pub use topology::{nodes_to_descriptors, TopologyDiff};

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::metrics;
use crate::node::{Node, NodeDescriptor, NodeStatus};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Health policy of the pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub resurrect_strategy: ResurrectStrategy,
    /// Base of the exponential backoff applied on every failure
    pub resurrect_timeout: Duration,
    /// Maximum exponent of the backoff
    pub resurrect_timeout_cutoff: u32,
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for PoolConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            resurrect_strategy: config.resurrect_strategy,
            resurrect_timeout: config.resurrect_timeout(),
            resurrect_timeout_cutoff: config.resurrect_timeout_cutoff,
            ping_timeout: config.ping_timeout(),
        }
    }
}

impl PoolConfig {
    /// Backoff for a node that has failed `dead_count` times in a row
    pub fn backoff(&self, dead_count: u32) -> Duration {
        let exponent = dead_count
            .saturating_sub(1)
            .min(self.resurrect_timeout_cutoff)
            .min(31);
        self.resurrect_timeout.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    nodes: Vec<Node>,
    /// Dead node ids, ascending by resurrect timeout
    dead: Vec<String>,
}

impl PoolState {
    fn find(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    fn remove_dead(&mut self, id: &str) {
        self.dead.retain(|d| d != id);
    }

    /// Re-insert `id` into the dead queue at its sorted position
    fn enqueue_dead(&mut self, id: &str) {
        self.remove_dead(id);
        let PoolState { nodes, dead } = self;
        let timeout_of = |dead_id: &str| {
            nodes
                .iter()
                .find(|n| n.id() == dead_id)
                .and_then(Node::resurrect_timeout)
        };
        let timeout = timeout_of(id);
        let position = dead.partition_point(|other| timeout_of(other) <= timeout);
        dead.insert(position, id.to_string());
    }
}

/// Registry of backend nodes with health tracking
pub struct NodePool {
    config: PoolConfig,
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
    connection: Arc<dyn Connection>,
}

impl NodePool {
    /// Create an empty pool; `connection` is used for resurrection probes
    pub fn new(config: PoolConfig, connection: Arc<dyn Connection>) -> Self {
        Self {
            config,
            state: RwLock::new(PoolState::default()),
            cursor: AtomicUsize::new(0),
            connection,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add one node
    pub fn add_node(&self, descriptor: NodeDescriptor) -> Result<Node> {
        let mut nodes = self.add_nodes(vec![descriptor])?;
        nodes
            .pop()
            .ok_or_else(|| TransportError::Other("Node was not added".to_string()))
    }

    /// Add several nodes; nothing is added if any id is already taken
    pub fn add_nodes(&self, descriptors: Vec<NodeDescriptor>) -> Result<Vec<Node>> {
        let mut state = self.state.write();

        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            let id = descriptor.resolved_id();
            if state.find(&id).is_some() || !seen.insert(id.clone()) {
                return Err(TransportError::DuplicateNode(id));
            }
        }

        let added: Vec<Node> = descriptors.into_iter().map(Node::from_descriptor).collect();
        for node in &added {
            debug!(node = %node.id(), "Adding node");
            metrics::update_node_state(node.id(), NodeStatus::Alive);
        }
        state.nodes.extend(added.iter().cloned());
        metrics::record_pool_size(state.nodes.len(), state.dead.len());

        Ok(added)
    }

    /// Remove a node; unknown ids are ignored
    pub fn remove_node(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.nodes.len();
        state.nodes.retain(|n| n.id() != id);
        state.remove_dead(id);
        let removed = state.nodes.len() != before;
        if removed {
            info!(node = %id, "Removed node");
            metrics::clear_node_state(id);
            metrics::record_pool_size(state.nodes.len(), state.dead.len());
        }
        removed
    }

    /// Remove every node
    pub fn empty(&self) {
        let mut state = self.state.write();
        for node in &state.nodes {
            metrics::clear_node_state(node.id());
        }
        state.nodes.clear();
        state.dead.clear();
        metrics::record_pool_size(0, 0);
    }

    /// Pick a node for a request
    ///
    /// Alive nodes accepted by the filter are preferred. When every node is
    /// dead the filter is applied to the dead ones instead, so a fully failed
    /// cluster still gets retried. `None` means no node is available.
    pub fn get_node(&self, options: &SelectOptions) -> Option<Node> {
        let state = self.state.read();
        let no_alive_nodes = state.dead.len() == state.nodes.len();

        let candidates: Vec<Node> = state
            .nodes
            .iter()
            .filter(|n| no_alive_nodes || n.is_alive())
            .filter(|n| options.filter.accepts(n))
            .cloned()
            .collect();
        drop(state);

        options.selector.select(&candidates, &self.cursor).cloned()
    }

    /// Mark a node dead and push its resurrect timeout back
    ///
    /// Returns `false` when the id is unknown, e.g. removed by a concurrent
    /// topology sync.
    pub fn mark_dead(&self, id: &str) -> bool {
        self.mark_dead_at(id, Instant::now())
    }

    pub(crate) fn mark_dead_at(&self, id: &str, now: Instant) -> bool {
        let mut state = self.state.write();
        let Some(node) = state.find_mut(id) else {
            debug!(node = %id, "Ignoring mark_dead for unknown node");
            return false;
        };

        let health = node.health_mut();
        health.status = NodeStatus::Dead;
        health.dead_count = health.dead_count.saturating_add(1);
        let backoff = self.config.backoff(health.dead_count);
        health.resurrect_timeout = Some(now + backoff);
        let dead_count = health.dead_count;

        state.enqueue_dead(id);

        warn!(
            node = %id,
            dead_count,
            backoff_ms = backoff.as_millis() as u64,
            "Node marked dead"
        );
        metrics::update_node_state(id, NodeStatus::Dead);
        metrics::record_pool_size(state.nodes.len(), state.dead.len());
        true
    }

    /// Mark a node alive and clear its failure history
    ///
    /// Returns `true` only if the node transitioned from dead to alive.
    pub fn mark_alive(&self, id: &str) -> bool {
        let mut state = self.state.write();
        let Some(node) = state.find_mut(id) else {
            return false;
        };

        let health = node.health_mut();
        let was_dead = health.status == NodeStatus::Dead;
        health.status = NodeStatus::Alive;
        health.dead_count = 0;
        health.resurrect_timeout = None;

        if was_dead {
            state.remove_dead(id);
            info!(node = %id, "Node marked alive");
            metrics::update_node_state(id, NodeStatus::Alive);
            metrics::record_pool_size(state.nodes.len(), state.dead.len());
        }
        was_dead
    }

    /// Snapshot of one node
    pub fn node(&self, id: &str) -> Option<Node> {
        self.state.read().find(id).cloned()
    }

    /// Snapshot of every node, in registry order
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.clone()
    }

    /// Dead node ids, earliest resurrect timeout first
    pub fn dead_ids(&self) -> Vec<String> {
        self.state.read().dead.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        let state = self.state.read();
        state.nodes.len() - state.dead.len()
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("NodePool")
            .field("nodes", &state.nodes.len())
            .field("dead", &state.dead)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::{ConnectionRequest, RawResponse};
    use crate::node::NodeRoles;
    use async_trait::async_trait;

    /// Answers every request with 200, or fails every request
    pub(crate) struct StubConnection {
        pub healthy: bool,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn request(&self, _node: &Node, _request: &ConnectionRequest) -> Result<RawResponse> {
            if self.healthy {
                Ok(RawResponse::new(200, ""))
            } else {
                Err(TransportError::Connection("connection refused".into()))
            }
        }
    }

    pub(crate) fn pool_with(config: PoolConfig, healthy: bool) -> NodePool {
        NodePool::new(config, Arc::new(StubConnection { healthy }))
    }

    pub(crate) fn pool() -> NodePool {
        pool_with(PoolConfig::default(), true)
    }

    pub(crate) fn desc(url: &str) -> NodeDescriptor {
        NodeDescriptor::parse(url).unwrap()
    }

    #[test]
    fn test_add_node() {
        let pool = pool();
        let href = "http://localhost:9200/";
        let node = pool.add_node(desc(href)).unwrap();
        assert_eq!(node.id(), href);
        assert_eq!(pool.node(href).unwrap().status(), NodeStatus::Alive);
        assert!(pool.dead_ids().is_empty());
    }

    #[test]
    fn test_add_duplicate_node() {
        let pool = pool();
        let href = "http://localhost:9200/";
        pool.add_node(desc(href)).unwrap();
        let err = pool.add_node(desc(href)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node with id 'http://localhost:9200/' is already present"
        );
    }

    #[test]
    fn test_add_nodes_is_all_or_nothing() {
        let pool = pool();
        let err = pool
            .add_nodes(vec![
                desc("http://localhost:9200"),
                desc("http://localhost:9201"),
                desc("http://localhost:9200"),
            ])
            .unwrap_err();
        assert!(matches!(err, TransportError::DuplicateNode(_)));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_mark_dead() {
        let pool = pool();
        let href = "http://localhost:9200/";
        pool.add_node(desc(href)).unwrap();
        assert!(pool.mark_dead(href));

        let node = pool.node(href).unwrap();
        assert_eq!(node.dead_count(), 1);
        assert!(node.resurrect_timeout().is_some());
        assert_eq!(node.status(), NodeStatus::Dead);
        assert_eq!(pool.dead_ids(), vec![href.to_string()]);
    }

    #[test]
    fn test_mark_dead_sorts_dead_queue() {
        let pool = pool();
        let href1 = "http://localhost:9200/1";
        let href2 = "http://localhost:9200/2";
        pool.add_nodes(vec![desc(href1), desc(href2)]).unwrap();

        let now = Instant::now();
        pool.mark_dead_at(href2, now);
        pool.mark_dead_at(href1, now + Duration::from_millis(10));
        assert_eq!(pool.dead_ids(), vec![href2.to_string(), href1.to_string()]);

        // A second failure pushes href2 behind href1
        pool.mark_dead_at(href2, now + Duration::from_millis(20));
        assert_eq!(pool.dead_ids(), vec![href1.to_string(), href2.to_string()]);
    }

    #[test]
    fn test_mark_dead_ignores_unknown_nodes() {
        let pool = pool();
        pool.add_node(desc("http://localhost:9200/")).unwrap();
        assert!(!pool.mark_dead("foo-bar"));
        assert!(pool.dead_ids().is_empty());
    }

    #[test]
    fn test_mark_alive() {
        let pool = pool();
        let href = "http://localhost:9200/";
        pool.add_node(desc(href)).unwrap();
        pool.mark_dead(href);
        assert!(pool.mark_alive(href));

        let node = pool.node(href).unwrap();
        assert_eq!(node.dead_count(), 0);
        assert!(node.resurrect_timeout().is_none());
        assert_eq!(node.status(), NodeStatus::Alive);
        assert!(pool.dead_ids().is_empty());

        // Already alive: no transition
        assert!(!pool.mark_alive(href));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = PoolConfig {
            resurrect_timeout: Duration::from_secs(60),
            resurrect_timeout_cutoff: 5,
            ..PoolConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(60));
        assert_eq!(config.backoff(2), Duration::from_secs(120));
        assert_eq!(config.backoff(6), Duration::from_secs(60 * 32));
        assert_eq!(config.backoff(40), Duration::from_secs(60 * 32));
        let mut last = Duration::ZERO;
        for count in 1..20 {
            assert!(config.backoff(count) >= last);
            last = config.backoff(count);
        }
    }

    #[test]
    fn test_get_node_returns_node() {
        let pool = pool();
        pool.add_node(desc("http://localhost:9200/")).unwrap();
        assert!(pool.get_node(&SelectOptions::default()).is_some());
    }

    #[test]
    fn test_get_node_custom_filter() {
        let pool = pool();
        let href1 = "http://localhost:9200/";
        let href2 = "http://localhost:9200/other";
        pool.add_nodes(vec![desc(href1), desc(href2)]).unwrap();

        let options = SelectOptions::default()
            .with_filter(NodeFilter::Custom(Arc::new(move |n| n.id() == href1)));
        for _ in 0..4 {
            assert_eq!(pool.get_node(&options).unwrap().id(), href1);
        }
    }

    #[test]
    fn test_filter_only_sees_alive_nodes() {
        let pool = pool();
        let href1 = "http://localhost:9200/";
        pool.add_nodes(vec![
            desc(href1),
            desc("http://localhost:9200/other"),
            desc("http://localhost:9200/other/stuff"),
        ])
        .unwrap();
        pool.mark_dead(href1);

        let options = SelectOptions::default().with_filter(NodeFilter::Custom(Arc::new(|n| {
            assert!(n.is_alive());
            true
        })));
        for _ in 0..4 {
            assert_ne!(pool.get_node(&options).unwrap().id(), href1);
        }
    }

    #[test]
    fn test_all_dead_returns_dead_node() {
        let pool = pool();
        let href1 = "http://localhost:9200/";
        let href2 = "http://localhost:9200/other";
        pool.add_nodes(vec![desc(href1), desc(href2)]).unwrap();
        pool.mark_dead(href1);
        pool.mark_dead(href2);

        let node = pool.get_node(&SelectOptions::default()).unwrap();
        assert_eq!(node.status(), NodeStatus::Dead);
    }

    #[test]
    fn test_remove_node() {
        let pool = pool();
        let href = "http://localhost:9200/";
        pool.add_node(desc(href)).unwrap();
        pool.mark_dead(href);
        assert!(pool.remove_node(href));
        assert!(pool.get_node(&SelectOptions::default()).is_none());
        assert!(pool.dead_ids().is_empty());
        assert!(!pool.remove_node(href));
    }

    #[test]
    fn test_removed_nodes_clear_state_gauge() {
        let recorder = crate::metrics::tests::NodeStateRecorder::default();
        ::metrics::with_local_recorder(&recorder, || {
            let pool = pool();
            pool.add_node(desc("http://localhost:9200/")).unwrap();
            pool.add_node(desc("http://localhost:9201/")).unwrap();
            pool.mark_dead("http://localhost:9200/");
            assert_eq!(recorder.value("http://localhost:9200/"), Some(2.0));

            pool.remove_node("http://localhost:9200/");
            assert_eq!(recorder.value("http://localhost:9200/"), Some(0.0));
            assert_eq!(recorder.value("http://localhost:9201/"), Some(1.0));

            pool.empty();
            assert_eq!(recorder.value("http://localhost:9201/"), Some(0.0));
        });
    }

    #[test]
    fn test_empty() {
        let pool = pool();
        pool.add_node(desc("http://localhost:9200/")).unwrap();
        pool.add_node(desc("http://localhost:9201/")).unwrap();
        pool.mark_dead("http://localhost:9201/");
        pool.empty();
        assert_eq!(pool.len(), 0);
        assert!(pool.dead_ids().is_empty());
    }

    #[test]
    fn test_round_robin_visits_each_alive_node_once() {
        let pool = pool();
        pool.add_nodes(vec![
            desc("http://localhost:9200"),
            desc("http://localhost:9201"),
            desc("http://localhost:9202"),
            desc("http://localhost:9203"),
        ])
        .unwrap();
        pool.mark_dead("http://localhost:9203/");

        let options = SelectOptions::default();
        let picked: HashSet<String> = (0..3)
            .map(|_| pool.get_node(&options).unwrap().id().to_string())
            .collect();
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains("http://localhost:9203/"));
    }

    #[test]
    fn test_master_only_node_is_filtered_by_default() {
        let pool = pool();
        pool.add_node(desc("http://localhost:9200/").with_roles(NodeRoles {
            master: true,
            data: false,
            ingest: false,
        }))
        .unwrap();

        assert!(pool.get_node(&SelectOptions::default()).is_none());
        assert!(pool
            .get_node(&SelectOptions::default().with_filter(NodeFilter::All))
            .is_some());
    }
}
