//! Prism Transport - Cluster-aware HTTP client core for Prism search clusters
//!
//! This crate decides which node serves each request, tracks node health,
//! discovers cluster topology and batches multi-search requests.
//!
//! # Architecture
//!
//! - **Node**: One backend endpoint with health state
//! - **Pool**: Node registry with dead queue, selection and resurrection
//! - **Topology sync**: Reconciles sniffed node lists into the pool
//! - **Connection**: Pluggable HTTP exchange (reqwest by default)
//! - **Transport**: Per-request orchestration with retries and notifications
//! - **Helpers**: Multi-search batching with bounded concurrency
//!
//! # Example
//!
//! ```ignore
//! use prism_transport::{Method, RequestOptions, RequestParams, Transport, TransportConfig};
//!
//! let transport = Transport::new(TransportConfig::with_nodes(["http://localhost:9200"]))?;
//! let response = transport
//!     .request(RequestParams::new(Method::GET, "/_cluster/health"), RequestOptions::default())
//!     .await?;
//! println!("{}", response.body);
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod helpers;
pub mod metrics;
pub mod node;
pub mod observer;
pub mod pool;
pub mod request_id;
pub mod serializer;
pub mod transport;

pub use config::{TlsConfig, TransportConfig};
pub use connection::{Connection, ConnectionRequest, HttpConnection, RawResponse};
pub use error::{Result, TransportError};
pub use helpers::{MultiSearch, MultiSearchConfig, SearchHandle, SearchResult};
pub use node::{Node, NodeDescriptor, NodeHealth, NodeRoles, NodeStatus};
pub use observer::{
    NodeEvent, RequestEvent, RequestMeta, ResponseEvent, ResurrectEvent, SniffEvent, SniffReason,
    TracingObserver, TransportObserver,
};
pub use pool::{
    nodes_to_descriptors, NodeFilter, NodePool, PoolConfig, ResurrectOutcome, ResurrectStrategy,
    SelectOptions, Selector, SelectorKind, TopologyDiff,
};
pub use request_id::{RequestId, RequestIdGenerator, SequentialIdGenerator};
pub use reqwest::Method;
pub use serializer::{JsonSerializer, ProtectionBypass, Serializer};
pub use transport::{RequestBody, RequestOptions, RequestParams, Response, Transport, TransportBuilder};
