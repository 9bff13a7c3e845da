//! Topology sync: reconcile the registry with a discovered node list

use super::NodePool;
use crate::error::{Result, TransportError};
use crate::metrics;
use crate::node::{Node, NodeDescriptor, NodeRoles, NodeStatus};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// What a topology sync changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// `(old id, new id)` pairs for nodes rediscovered at the same URL
    pub rekeyed: Vec<(String, String)>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.rekeyed.is_empty()
    }
}

impl NodePool {
    /// Replace the node set with `descriptors`
    ///
    /// Nodes whose id is already known keep their health state. A known node
    /// found at the same URL under a new id is re-keyed, keeping its health
    /// and roles. Unknown nodes are added alive, and nodes missing from the
    /// list are removed together with their dead queue entries. Applying the
    /// same list twice is a no-op.
    pub fn update(&self, descriptors: Vec<NodeDescriptor>) -> TopologyDiff {
        let mut state = self.state.write();
        let mut diff = TopologyDiff::default();

        let discovered_ids: HashSet<String> =
            descriptors.iter().map(NodeDescriptor::resolved_id).collect();
        let mut next: Vec<Node> = Vec::with_capacity(descriptors.len());
        let mut claimed: HashSet<String> = HashSet::new();
        let mut renames: HashMap<String, String> = HashMap::new();

        for descriptor in descriptors {
            let id = descriptor.resolved_id();
            if next.iter().any(|n| n.id() == id) {
                continue;
            }

            if let Some(existing) = state.find(&id) {
                claimed.insert(id);
                next.push(existing.clone());
                continue;
            }

            let url = descriptor.public_url();
            let same_url = state.nodes.iter().find(|n| {
                n.url() == &url && !discovered_ids.contains(n.id()) && !claimed.contains(n.id())
            });
            if let Some(existing) = same_url {
                let mut node = existing.clone();
                let old_id = node.id().to_string();
                debug!(old = %old_id, new = %id, "Re-keying node");
                node.set_id(id.clone());
                claimed.insert(old_id.clone());
                renames.insert(old_id.clone(), id.clone());
                diff.rekeyed.push((old_id, id));
                next.push(node);
                continue;
            }

            diff.added.push(id);
            next.push(Node::from_descriptor(descriptor));
        }

        diff.removed = state
            .nodes
            .iter()
            .filter(|n| !claimed.contains(n.id()))
            .map(|n| n.id().to_string())
            .collect();

        let kept: HashSet<&str> = next.iter().map(Node::id).collect();
        let dead: Vec<String> = state
            .dead
            .iter()
            .map(|id| renames.get(id).cloned().unwrap_or_else(|| id.clone()))
            .filter(|id| kept.contains(id.as_str()))
            .collect();
        drop(kept);

        state.nodes = next;
        state.dead = dead;

        for id in &diff.removed {
            metrics::clear_node_state(id);
        }
        for (old_id, new_id) in &diff.rekeyed {
            metrics::clear_node_state(old_id);
            if let Some(node) = state.find(new_id) {
                metrics::update_node_state(new_id, node.status());
            }
        }
        for id in &diff.added {
            metrics::update_node_state(id, NodeStatus::Alive);
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                rekeyed = diff.rekeyed.len(),
                total = state.nodes.len(),
                "Topology updated"
            );
        }
        metrics::record_pool_size(state.nodes.len(), state.dead.len());
        diff
    }
}

/// Turn a node-info response into node descriptors
///
/// Nodes without an HTTP publish address are skipped. Accepted address forms
/// are `ip:port`, `[ipv6]:port`, `hostname/ip:port` and `hostname/[ipv6]:port`;
/// when a hostname is present it is preferred over the IP.
pub fn nodes_to_descriptors(body: &Value, scheme: &str) -> Result<Vec<NodeDescriptor>> {
    let nodes = body
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            TransportError::Deserialization("Topology response has no nodes object".to_string())
        })?;

    let mut descriptors = Vec::with_capacity(nodes.len());
    for (id, info) in nodes {
        let Some(address) = info
            .get("http")
            .and_then(|http| http.get("publish_address"))
            .and_then(Value::as_str)
        else {
            warn!(node = %id, "Skipping node without http publish address");
            continue;
        };

        let url = format!("{}://{}", scheme, host_and_port(address));
        let mut descriptor = NodeDescriptor::parse(&url)?.with_id(id.clone());

        if let Some(roles) = info.get("roles").and_then(Value::as_array) {
            let names: Vec<&str> = roles.iter().filter_map(Value::as_str).collect();
            descriptor = descriptor.with_roles(NodeRoles::from_role_list(&names));
        }
        descriptors.push(descriptor);
    }

    Ok(descriptors)
}

fn host_and_port(address: &str) -> String {
    match address.split_once('/') {
        Some((hostname, ip_and_port)) => {
            let port = ip_and_port.rsplit(':').next().unwrap_or_default();
            format!("{}:{}", hostname, port)
        }
        None => address.to_string(),
    }
}
