//! Bringing dead nodes back into rotation

use super::NodePool;
use crate::connection::ConnectionRequest;
use crate::metrics;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

/// How dead nodes are brought back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectStrategy {
    /// Probe the node with `HEAD /`; any HTTP response means alive
    #[default]
    Ping,
    /// Assume the node recovered without probing it
    Optimistic,
    /// Never resurrect; nodes only come back through a topology sync
    None,
}

impl ResurrectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
            ResurrectStrategy::None => "none",
        }
    }
}

/// Result of one resurrection attempt
#[derive(Debug, Clone)]
pub struct ResurrectOutcome {
    pub strategy: ResurrectStrategy,
    /// Node snapshot after the attempt
    pub node: Node,
    pub is_alive: bool,
}

impl NodePool {
    /// Try to resurrect the head of the dead queue
    ///
    /// Only the node with the earliest resurrect timeout is considered, and
    /// only once that timeout has passed at `now`. Returns `None` when no
    /// attempt was made.
    pub async fn resurrect(&self, now: Instant) -> Option<ResurrectOutcome> {
        let strategy = self.config.resurrect_strategy;
        if strategy == ResurrectStrategy::None {
            return None;
        }

        let head = {
            let state = self.state.read();
            let id = state.dead.first()?;
            let node = state.find(id)?;
            if node.resurrect_timeout().is_some_and(|at| at > now) {
                return None;
            }
            node.clone()
        };

        let is_alive = match strategy {
            ResurrectStrategy::Ping => {
                debug!(node = %head.id(), "Pinging dead node");
                let ping_timeout = self.config.ping_timeout;
                let probe = tokio::time::timeout(
                    ping_timeout,
                    self.connection
                        .request(&head, &ConnectionRequest::ping(ping_timeout)),
                )
                .await;
                let is_alive = matches!(probe, Ok(Ok(_)));
                if is_alive {
                    self.mark_alive(head.id());
                } else {
                    self.mark_dead(head.id());
                }
                is_alive
            }
            ResurrectStrategy::Optimistic | ResurrectStrategy::None => {
                self.mark_alive(head.id());
                true
            }
        };

        info!(
            node = %head.id(),
            strategy = strategy.as_str(),
            is_alive,
            "Resurrection attempt"
        );
        metrics::record_resurrection(strategy.as_str(), is_alive);

        let node = self.node(head.id()).unwrap_or(head);
        Some(ResurrectOutcome {
            strategy,
            node,
            is_alive,
        })
    }
}
