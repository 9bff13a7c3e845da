//! Request dispatcher
//!
//! Orchestrates one logical request: correlation id, node selection,
//! retries on another node after connectivity failures, resurrection of dead
//! nodes, topology sniffing and lifecycle notifications.
//!
//! ```text
//! request ──▶ sniff? ──▶ resurrect ──▶ select node ──▶ send
//!                             ▲                          │
//!                             └──── mark dead, retry ◀───┤ transport failure
//!                                                        │
//!                              mark alive, decode ◀──────┘ HTTP response
//! ```

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionRequest, HttpConnection, RawResponse};
use crate::error::{Result, TransportError};
use crate::metrics::{self, RequestTimer};
use crate::node::NodeDescriptor;
use crate::observer::{
    NodeEvent, Observers, RequestEvent, RequestMeta, ResponseEvent, ResurrectEvent, SniffEvent,
    SniffReason, TransportObserver,
};
use crate::pool::{nodes_to_descriptors, NodeFilter, NodePool, PoolConfig, SelectOptions, Selector};
use crate::request_id::{RequestId, RequestIdGenerator, SequentialIdGenerator};
use crate::serializer::{JsonSerializer, Serializer};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request payload
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Encoded with [`Serializer::serialize`]
    Json(Value),
    /// Encoded with [`Serializer::ndserialize`]
    Bulk(Vec<Value>),
    /// Sent as-is
    Text(String),
}

/// What to send, independent of any node
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub method: Method,
    pub path: String,
    pub querystring: Map<String, Value>,
    pub body: RequestBody,
}

impl RequestParams {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: Map::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.querystring.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Per-request overrides
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Correlation id; generated when absent
    pub id: Option<RequestId>,
    /// Caller context; the transport default when absent
    pub context: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub max_retries: Option<u32>,
    pub request_timeout: Option<Duration>,
    /// Error statuses treated as success
    pub ignore: Vec<u16>,
}

impl RequestOptions {
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_ignore(mut self, status: u16) -> Self {
        self.ignore.push(status);
        self
    }
}

/// Decoded response of a logical request
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// JSON bodies are decoded, other bodies are a JSON string, `HEAD` is a boolean
    pub body: Value,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone)]
struct Settings {
    max_retries: u32,
    request_timeout: Duration,
    retry_on_status: Vec<u16>,
    headers: BTreeMap<String, String>,
    context: Option<Value>,
    sniff_on_start: bool,
    sniff_on_connection_fault: bool,
    sniff_interval: Option<Duration>,
    sniff_endpoint: String,
    /// Scheme of the first seed node, applied to sniffed addresses
    scheme: String,
}

struct SniffState {
    first_request: AtomicBool,
    running: AtomicBool,
    last: Mutex<Instant>,
}

/// Clears the running flag even if the sniff future is dropped
struct SniffGuard<'a>(&'a AtomicBool);

impl Drop for SniffGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    pool: Arc<NodePool>,
    connection: Arc<dyn Connection>,
    serializer: Arc<dyn Serializer>,
    observers: Observers,
    ids: Arc<dyn RequestIdGenerator>,
    select: SelectOptions,
    settings: Settings,
    sniff: SniffState,
}

/// Cluster-aware request dispatcher
///
/// Cheap to clone; clones and [children](Transport::child) share the node
/// pool, connection, observers, id generator and sniff state.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    name: String,
}

impl Transport {
    /// Build a transport with the default connection, serializer and ids
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder::new(config)
    }

    /// Client name reported in notifications
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.shared.pool
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.shared.serializer
    }

    pub fn max_retries(&self) -> u32 {
        self.shared.settings.max_retries
    }

    /// Transport sharing all state with this one under another client name
    pub fn child(&self, name: impl Into<String>) -> Transport {
        Transport {
            shared: self.shared.clone(),
            name: name.into(),
        }
    }

    /// Send one logical request
    pub async fn request(&self, params: RequestParams, options: RequestOptions) -> Result<Response> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| self.shared.ids.next_id());
        let context = options
            .context
            .clone()
            .or_else(|| self.shared.settings.context.clone());
        let mut meta = RequestMeta::new(id, context, self.name.clone());
        self.run(&params, &options, &mut meta, true).await
    }

    /// Sniff the topology now; returns the node ids after the sync
    pub async fn sniff(&self) -> Result<Vec<String>> {
        let meta = RequestMeta::new(
            self.shared.ids.next_id(),
            self.shared.settings.context.clone(),
            self.name.clone(),
        );
        self.sniff_with(SniffReason::Manual, &meta).await
    }

    /// Dispatch plus exactly one `on_response`
    async fn run(
        &self,
        params: &RequestParams,
        options: &RequestOptions,
        meta: &mut RequestMeta,
        allow_sniff: bool,
    ) -> Result<Response> {
        let timer = RequestTimer::new(params.method.as_str());
        let result = self.dispatch(params, options, meta, allow_sniff).await;

        let (status, error) = match &result {
            Ok(response) => {
                timer.success();
                (Some(response.status), None)
            }
            Err(error) => {
                timer.error(error.error_type());
                (error.status(), Some(error.clone()))
            }
        };
        self.shared.observers.response(&ResponseEvent {
            meta: meta.clone(),
            status,
            error,
        });
        result
    }

    async fn dispatch(
        &self,
        params: &RequestParams,
        options: &RequestOptions,
        meta: &mut RequestMeta,
        allow_sniff: bool,
    ) -> Result<Response> {
        let shared = &self.shared;
        let settings = &shared.settings;
        let request = self.connection_request(params, options)?;

        if allow_sniff {
            let first_request = shared.sniff.first_request.swap(false, Ordering::SeqCst);
            if first_request && settings.sniff_on_start {
                let _ = self.sniff_with(SniffReason::Start, meta).await;
            } else if self.sniff_interval_elapsed() {
                let _ = self.sniff_with(SniffReason::Interval, meta).await;
            }
        }

        let max_retries = options.max_retries.unwrap_or(settings.max_retries);
        let request_timeout = request.timeout;

        loop {
            if let Some(outcome) = shared.pool.resurrect(Instant::now()).await {
                shared.observers.resurrect(&ResurrectEvent {
                    meta: meta.clone(),
                    strategy: outcome.strategy,
                    node: outcome.node,
                    is_alive: outcome.is_alive,
                });
            }

            let Some(node) = shared.pool.get_node(&shared.select) else {
                let error = TransportError::NoLivingConnections;
                warn!(request_id = %meta.id, "No node available for request");
                shared.observers.request(&self.request_event(meta, &request, Some(error.clone())));
                return Err(error);
            };

            meta.node = Some(node.clone());
            shared.observers.request(&self.request_event(meta, &request, None));
            debug!(
                request_id = %meta.id,
                node = %node.id(),
                attempt = meta.attempts,
                method = %request.method,
                path = %request.path,
                "Dispatching request"
            );

            let outcome = tokio::time::timeout(
                request_timeout,
                shared.connection.request(&node, &request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout(format!(
                    "Request to {} timed out after {}ms",
                    node.id(),
                    request_timeout.as_millis()
                )))
            });

            match outcome {
                Err(error) if error.is_transport_failure() => {
                    if shared.pool.mark_dead(node.id()) {
                        let node = shared.pool.node(node.id()).unwrap_or(node);
                        shared.observers.node_dead(&NodeEvent {
                            meta: meta.clone(),
                            node,
                            error: Some(error.clone()),
                        });
                    }

                    if allow_sniff && settings.sniff_on_connection_fault {
                        let _ = self.sniff_with(SniffReason::ConnectionFault, meta).await;
                    }

                    if meta.attempts < max_retries {
                        meta.attempts += 1;
                        metrics::record_retry(error.error_type());
                        debug!(request_id = %meta.id, error = %error, "Retrying request");
                        continue;
                    }
                    return Err(error);
                }
                Err(error) => return Err(error),
                Ok(raw) => {
                    if shared.pool.mark_alive(node.id()) {
                        let node = shared.pool.node(node.id()).unwrap_or(node);
                        shared.observers.node_alive(&NodeEvent {
                            meta: meta.clone(),
                            node,
                            error: None,
                        });
                    }

                    if settings.retry_on_status.contains(&raw.status) && meta.attempts < max_retries {
                        meta.attempts += 1;
                        metrics::record_retry("status");
                        debug!(request_id = %meta.id, status = raw.status, "Retrying request");
                        continue;
                    }
                    return self.decode(params, options, raw, meta);
                }
            }
        }
    }

    fn connection_request(
        &self,
        params: &RequestParams,
        options: &RequestOptions,
    ) -> Result<ConnectionRequest> {
        let shared = &self.shared;
        let mut request = ConnectionRequest::new(params.method.clone(), params.path.clone());
        request.querystring = shared.serializer.qserialize(&params.querystring);
        request.timeout = options
            .request_timeout
            .unwrap_or(shared.settings.request_timeout);
        request.headers = shared.settings.headers.clone();

        let content_type = match &params.body {
            RequestBody::Empty => None,
            RequestBody::Json(value) => {
                request.body = Some(shared.serializer.serialize(value)?);
                Some("application/json")
            }
            RequestBody::Bulk(items) => {
                request.body = Some(shared.serializer.ndserialize(items)?);
                Some("application/x-ndjson")
            }
            RequestBody::Text(text) => {
                request.body = Some(text.clone());
                None
            }
        };
        if let Some(content_type) = content_type {
            request
                .headers
                .insert("content-type".to_string(), content_type.to_string());
        }
        request
            .headers
            .extend(options.headers.iter().map(|(k, v)| (k.to_lowercase(), v.clone())));

        Ok(request)
    }

    fn decode(
        &self,
        params: &RequestParams,
        options: &RequestOptions,
        raw: RawResponse,
        meta: &RequestMeta,
    ) -> Result<Response> {
        let status = raw.status;
        let success = (200..300).contains(&status);
        let is_head = params.method == Method::HEAD;

        let body = if is_head {
            Value::Bool(success)
        } else if raw.body.is_empty() {
            Value::Null
        } else if raw.is_json() {
            self.shared.serializer.deserialize(&raw.body)?
        } else {
            Value::String(raw.body)
        };

        if success || options.ignore.contains(&status) || (is_head && status == 404) {
            Ok(Response {
                status,
                headers: raw.headers,
                body,
                meta: meta.clone(),
            })
        } else {
            Err(TransportError::response(status, body))
        }
    }

    fn request_event(
        &self,
        meta: &RequestMeta,
        request: &ConnectionRequest,
        error: Option<TransportError>,
    ) -> RequestEvent {
        RequestEvent {
            meta: meta.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            querystring: request.querystring.clone(),
            error,
        }
    }

    fn sniff_interval_elapsed(&self) -> bool {
        let Some(interval) = self.shared.settings.sniff_interval else {
            return false;
        };
        let last = *self.shared.sniff.last.lock();
        Instant::now().duration_since(last) >= interval
    }

    /// One sniff at a time; failures only reach observers and the caller
    fn sniff_with<'a>(
        &'a self,
        reason: SniffReason,
        trigger: &'a RequestMeta,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        async move {
            let shared = &self.shared;
            if shared.sniff.running.swap(true, Ordering::SeqCst) {
                debug!(reason = reason.as_str(), "Sniff already in progress");
                return Err(TransportError::Other(
                    "A sniff is already in progress".to_string(),
                ));
            }
            let _guard = SniffGuard(&shared.sniff.running);
            *shared.sniff.last.lock() = Instant::now();

            debug!(request_id = %trigger.id, reason = reason.as_str(), "Sniffing topology");
            let params = RequestParams::new(Method::GET, shared.settings.sniff_endpoint.clone());
            let options = RequestOptions::default();
            let mut meta = RequestMeta::new(
                trigger.id.clone(),
                trigger.context.clone(),
                trigger.name.clone(),
            );

            let result = self
                .run(&params, &options, &mut meta, false)
                .await
                .and_then(|response| nodes_to_descriptors(&response.body, &shared.settings.scheme))
                .and_then(|descriptors| {
                    if descriptors.is_empty() {
                        Err(TransportError::Other(
                            "Sniff returned no nodes with an http address".to_string(),
                        ))
                    } else {
                        Ok(descriptors)
                    }
                })
                .map(|descriptors| {
                    shared.pool.update(descriptors);
                    shared
                        .pool
                        .nodes()
                        .iter()
                        .map(|n| n.id().to_string())
                        .collect::<Vec<_>>()
                });

            metrics::record_sniff(reason.as_str(), result.is_ok());
            if let Err(error) = &result {
                warn!(request_id = %trigger.id, reason = reason.as_str(), error = %error, "Sniff failed");
            }
            shared.observers.sniff(&SniffEvent {
                meta: trigger.clone(),
                reason,
                nodes: result.as_ref().map(Clone::clone).unwrap_or_default(),
                error: result.as_ref().err().cloned(),
            });
            result
        }
        .boxed()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("pool", &self.shared.pool)
            .field("observers", &self.shared.observers)
            .finish()
    }
}

/// Assembles a [`Transport`] with pluggable parts
pub struct TransportBuilder {
    config: TransportConfig,
    connection: Option<Arc<dyn Connection>>,
    serializer: Option<Arc<dyn Serializer>>,
    observers: Observers,
    ids: Option<Arc<dyn RequestIdGenerator>>,
    filter: NodeFilter,
    selector: Option<Selector>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connection: None,
            serializer: None,
            observers: Observers::default(),
            ids: None,
            filter: NodeFilter::default(),
            selector: None,
        }
    }

    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TransportObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn RequestIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn node_filter(mut self, filter: NodeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Overrides `node_selector` from the config
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn build(self) -> Result<Transport> {
        let config = self.config;
        config.validate()?;

        let descriptors = config
            .nodes
            .iter()
            .map(|url| NodeDescriptor::parse(url))
            .collect::<Result<Vec<_>>>()?;
        let scheme = descriptors
            .first()
            .map(|d| d.url.scheme().to_string())
            .unwrap_or_else(|| "http".to_string());

        let connection = match self.connection {
            Some(connection) => connection,
            None => Arc::new(HttpConnection::new(&config.tls)?),
        };
        let serializer = self.serializer.unwrap_or_else(|| {
            Arc::new(JsonSerializer::new(
                config.disable_prototype_poisoning_protection,
            ))
        });
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(SequentialIdGenerator::new()));

        let pool = Arc::new(NodePool::new(PoolConfig::from(&config), connection.clone()));
        pool.add_nodes(descriptors)?;

        let mut headers: BTreeMap<String, String> = config
            .headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        headers
            .entry("user-agent".to_string())
            .or_insert_with(|| format!("prism-transport/{}", env!("CARGO_PKG_VERSION")));

        let settings = Settings {
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
            retry_on_status: config.retry_on_status.clone(),
            headers,
            context: config.context.clone(),
            sniff_on_start: config.sniff_on_start,
            sniff_on_connection_fault: config.sniff_on_connection_fault,
            sniff_interval: config.sniff_interval(),
            sniff_endpoint: config.sniff_endpoint.clone(),
            scheme,
        };

        let select = SelectOptions::new(
            self.filter,
            self.selector
                .unwrap_or_else(|| Selector::from(config.node_selector)),
        );

        debug!(
            name = %config.name,
            nodes = pool.len(),
            "Transport created"
        );

        Ok(Transport {
            shared: Arc::new(Shared {
                pool,
                connection,
                serializer,
                observers: self.observers,
                ids,
                select,
                settings,
                sniff: SniffState {
                    first_request: AtomicBool::new(true),
                    running: AtomicBool::new(false),
                    last: Mutex::new(Instant::now()),
                },
            }),
            name: config.name,
        })
    }
}
