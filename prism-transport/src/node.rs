//! Backend nodes and their health state
//!
//! ```text
//! Node states: Alive ⇄ Dead
//!
//! Transitions:
//!   alive → dead: transport failure or failed resurrection probe
//!   dead → alive: any HTTP response, successful probe, optimistic resurrection
//! ```

use crate::error::{Result, TransportError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// Health status of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is eligible for regular selection
    #[default]
    Alive,
    /// Node failed and waits in the dead queue
    Dead,
}

impl NodeStatus {
    /// Get status as a string for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Alive => "alive",
            NodeStatus::Dead => "dead",
        }
    }
}

/// Role flags learned from topology
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    pub master: bool,
    pub data: bool,
    pub ingest: bool,
}

impl NodeRoles {
    /// Map a role list from a sniff response; unknown roles are ignored
    pub fn from_role_list<S: AsRef<str>>(roles: &[S]) -> Self {
        let has = |name: &str| roles.iter().any(|r| r.as_ref() == name);
        Self {
            master: has("master") || has("cluster_manager"),
            data: has("data"),
            ingest: has("ingest"),
        }
    }

    /// Dedicated master nodes should not receive regular traffic
    pub fn is_master_only(&self) -> bool {
        self.master && !self.data && !self.ingest
    }
}

/// Everything needed to create a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub url: Url,
    pub id: Option<String>,
    pub roles: Option<NodeRoles>,
    pub headers: BTreeMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            id: None,
            roles: None,
            headers: BTreeMap::new(),
        }
    }

    /// Parse a node URL such as `http://localhost:9200`
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" => Ok(Self::new(url)),
            other => Err(TransportError::Configuration(format!(
                "Unsupported protocol '{}' for node {}",
                other, url
            ))),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_roles(mut self, roles: NodeRoles) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// URL with any user-info removed
    pub fn public_url(&self) -> Url {
        let mut url = self.url.clone();
        // Only fails for cannot-be-a-base URLs, which `parse` never accepts.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url
    }

    /// Id the node will be registered under
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| self.public_url().to_string())
    }
}

/// Mutable health bookkeeping of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeHealth {
    pub status: NodeStatus,
    /// Consecutive failures since the node was last alive
    pub dead_count: u32,
    /// Instant before which the node is not probed; `None` while alive
    pub resurrect_timeout: Option<Instant>,
}

/// A backend endpoint
///
/// Values handed out by the pool are snapshots: health changes go through
/// [`NodePool::mark_dead`](crate::NodePool::mark_dead) and
/// [`NodePool::mark_alive`](crate::NodePool::mark_alive).
#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    url: Url,
    roles: Option<NodeRoles>,
    headers: Arc<BTreeMap<String, String>>,
    health: NodeHealth,
}

impl Node {
    /// Build an alive node, moving URL credentials into an authorization header
    pub fn from_descriptor(descriptor: NodeDescriptor) -> Self {
        let id = descriptor.resolved_id();
        let url = descriptor.public_url();
        let mut headers = descriptor.headers;

        let username = decode_userinfo(descriptor.url.username());
        let password = descriptor.url.password().map(decode_userinfo);
        if !username.is_empty() || password.is_some() {
            let credentials = format!("{}:{}", username, password.unwrap_or_default());
            headers.entry("authorization".to_string()).or_insert_with(|| {
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                )
            });
        }

        Self {
            id,
            url,
            roles: descriptor.roles,
            headers: Arc::new(headers),
            health: NodeHealth::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn roles(&self) -> Option<NodeRoles> {
        self.roles
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn health(&self) -> NodeHealth {
        self.health
    }

    pub fn status(&self) -> NodeStatus {
        self.health.status
    }

    pub fn is_alive(&self) -> bool {
        self.health.status == NodeStatus::Alive
    }

    pub fn dead_count(&self) -> u32 {
        self.health.dead_count
    }

    pub fn resurrect_timeout(&self) -> Option<Instant> {
        self.health.resurrect_timeout
    }

    pub(crate) fn health_mut(&mut self) -> &mut NodeHealth {
        &mut self.health
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == self.url.as_str() {
            write!(f, "{}", self.url)
        } else {
            write!(f, "{} ({})", self.id, self.url)
        }
    }
}

/// Percent-decode a URL user-info component; `+` is literal there
fn decode_userinfo(raw: &str) -> String {
    let escaped = raw.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={}", escaped).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}
