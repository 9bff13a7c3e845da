//! Multi-search batching
//!
//! Collects individual searches into windows and sends each window as one
//! `_msearch` request.
//!
//! ```text
//! search() ──▶ window ──(size or interval)──▶ sealed FIFO ──▶ in flight (≤ concurrency)
//!                ▲                                                   │
//!                └──────────── 429, after `wait` ◀───────────────────┘
//! ```
//!
//! Every accepted search resolves exactly once: with its slice of the
//! response, with its own error status, or with the error of the whole
//! physical request.

use crate::error::{Result, TransportError};
use crate::metrics;
use crate::transport::{RequestBody, RequestOptions, RequestParams, Transport};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

const STOPPED_MESSAGE: &str = "The msearch processor has been stopped";

/// Multi-search batching configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiSearchConfig {
    /// Searches per physical request
    #[serde(default = "default_operations")]
    pub operations: usize,

    /// Maximum physical requests in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Flush a partial window this long after its first search arrived
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Delay before a search rejected with 429 is queued again
    #[serde(default = "default_wait")]
    pub wait_ms: u64,

    /// 429 requeues per search; the transport `max_retries` when unset
    #[serde(default)]
    pub retries: Option<u32>,
}

fn default_operations() -> usize {
    5
}

fn default_concurrency() -> usize {
    5
}

fn default_flush_interval() -> u64 {
    500
}

fn default_wait() -> u64 {
    5000
}

impl Default for MultiSearchConfig {
    fn default() -> Self {
        Self {
            operations: default_operations(),
            concurrency: default_concurrency(),
            flush_interval_ms: default_flush_interval(),
            wait_ms: default_wait(),
            retries: None,
        }
    }
}

impl MultiSearchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.operations == 0 {
            return Err(TransportError::Configuration(
                "operations must be at least 1".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(TransportError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// This search's slice of the `_msearch` response
    pub body: Value,
    /// `_source` of every hit
    pub documents: Vec<Value>,
}

impl SearchResult {
    fn from_item(item: Value) -> Self {
        let documents = item
            .get("hits")
            .and_then(|hits| hits.get("hits"))
            .and_then(Value::as_array)
            .map(|hits| hits.iter().filter_map(|hit| hit.get("_source").cloned()).collect())
            .unwrap_or_default();
        Self {
            body: item,
            documents,
        }
    }
}

type Reply = oneshot::Sender<Result<SearchResult>>;

struct Operation {
    header: Value,
    body: Value,
    /// 429 requeues so far
    requeues: u32,
    reply: Reply,
}

impl Operation {
    fn resolve(self, outcome: Result<SearchResult>) {
        // The caller may have dropped its handle
        let _ = self.reply.send(outcome);
    }
}

enum Command {
    Search(Operation),
    Stop,
}

enum Lifecycle {
    Running,
    Stopped,
}

/// Pending result of [`MultiSearch::search`]
pub struct SearchHandle {
    state: HandleState,
}

enum HandleState {
    Pending(oneshot::Receiver<Result<SearchResult>>),
    Ready(Option<Result<SearchResult>>),
}

impl SearchHandle {
    fn ready(outcome: Result<SearchResult>) -> Self {
        Self {
            state: HandleState::Ready(Some(outcome)),
        }
    }
}

impl Future for SearchHandle {
    type Output = Result<SearchResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Pending(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(TransportError::Other(
                        "The msearch processor dropped the search".to_string(),
                    ))
                })
            }),
            HandleState::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or_else(|| {
                Err(TransportError::Other(
                    "Search handle polled after completion".to_string(),
                ))
            })),
        }
    }
}

/// Batches searches into `_msearch` requests
///
/// Must be created inside a tokio runtime; the batching loop runs as a
/// spawned task until [`stop`](MultiSearch::stop) is called or every handle
/// is dropped, and drains accepted searches before exiting.
#[derive(Clone)]
pub struct MultiSearch {
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    stop_error: Arc<Mutex<Option<TransportError>>>,
    finished: watch::Receiver<bool>,
}

impl MultiSearch {
    /// Start a processor; `options` apply to every physical request
    pub fn new(transport: Transport, config: MultiSearchConfig, options: RequestOptions) -> Result<Self> {
        config.validate()?;
        let retries = config.retries.unwrap_or_else(|| transport.max_retries());

        let (commands, receiver) = mpsc::unbounded_channel();
        let (done, finished) = watch::channel(false);

        let processor = Processor {
            transport,
            options,
            operations: config.operations,
            concurrency: config.concurrency,
            flush_interval: config.flush_interval(),
            wait: config.wait(),
            retries,
            window: Vec::new(),
            deadline: None,
            sealed: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            delayed: FuturesUnordered::new(),
        };
        tokio::spawn(processor.run(receiver, done));

        debug!(
            operations = config.operations,
            concurrency = config.concurrency,
            "Multi-search processor started"
        );

        Ok(Self {
            commands,
            lifecycle: Arc::new(Mutex::new(Lifecycle::Running)),
            stop_error: Arc::new(Mutex::new(None)),
            finished,
        })
    }

    /// Queue one search
    ///
    /// Invalid input and submissions after [`stop`](MultiSearch::stop)
    /// resolve immediately without entering a window.
    pub fn search(&self, header: Value, body: Value) -> SearchHandle {
        if !header.is_object() {
            return SearchHandle::ready(Err(TransportError::Configuration(
                "The header should be an object".to_string(),
            )));
        }
        if !body.is_object() {
            return SearchHandle::ready(Err(TransportError::Configuration(
                "The body should be an object".to_string(),
            )));
        }

        let lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Stopped) {
            return SearchHandle::ready(Err(self.stopped_error()));
        }

        let (reply, rx) = oneshot::channel();
        let operation = Operation {
            header,
            body,
            requeues: 0,
            reply,
        };
        if let Err(mpsc::error::SendError(Command::Search(operation))) =
            self.commands.send(Command::Search(operation))
        {
            operation.resolve(Err(self.stopped_error()));
        }

        SearchHandle {
            state: HandleState::Pending(rx),
        }
    }

    /// Queue one search and hand its outcome to `callback`
    ///
    /// Outcomes known at submission time invoke the callback before this
    /// returns; otherwise it runs on a spawned task.
    pub fn search_with_callback<F>(&self, header: Value, body: Value, callback: F)
    where
        F: FnOnce(Result<SearchResult>) + Send + 'static,
    {
        let handle = self.search(header, body);
        match handle.state {
            HandleState::Ready(outcome) => callback(outcome.unwrap_or_else(|| {
                Err(TransportError::Other("Search already consumed".to_string()))
            })),
            HandleState::Pending(rx) => {
                let handle = SearchHandle {
                    state: HandleState::Pending(rx),
                };
                tokio::spawn(async move { callback(handle.await) });
            }
        }
    }

    /// Stop accepting searches; accepted ones still complete
    ///
    /// With an error, [`finished`](MultiSearch::finished) fails with it.
    pub fn stop(&self, error: Option<TransportError>) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Stopped) {
            return;
        }
        *lifecycle = Lifecycle::Stopped;
        *self.stop_error.lock() = error;
        let _ = self.commands.send(Command::Stop);
        info!("Multi-search processor stopping");
    }

    /// Error for submissions after [`stop`](MultiSearch::stop)
    fn stopped_error(&self) -> TransportError {
        self.stop_error
            .lock()
            .clone()
            .unwrap_or_else(|| TransportError::Configuration(STOPPED_MESSAGE.to_string()))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Stopped)
    }

    /// Wait until the processor stopped and every accepted search resolved
    pub async fn finished(&self) -> Result<()> {
        let mut finished = self.finished.clone();
        finished
            .wait_for(|done| *done)
            .await
            .map_err(|_| TransportError::Other("The msearch processor exited".to_string()))?;

        match self.stop_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MultiSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSearch")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Processor {
    transport: Transport,
    options: RequestOptions,
    operations: usize,
    concurrency: usize,
    flush_interval: Duration,
    wait: Duration,
    retries: u32,
    window: Vec<Operation>,
    /// Flush time of the current window, set by its first search
    deadline: Option<Instant>,
    sealed: VecDeque<Vec<Operation>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Vec<Operation>>>,
    delayed: FuturesUnordered<BoxFuture<'static, Vec<Operation>>>,
}

impl Processor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, done: watch::Sender<bool>) {
        let mut accepting = true;

        loop {
            self.dispatch_sealed();
            if !accepting && self.is_idle() {
                break;
            }

            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv(), if accepting => match command {
                    Some(Command::Search(operation)) => self.push(operation),
                    Some(Command::Stop) | None => {
                        accepting = false;
                        self.seal();
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.seal();
                }
                Some(requeue) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    if !requeue.is_empty() {
                        let wait = self.wait;
                        self.delayed.push(
                            async move {
                                tokio::time::sleep(wait).await;
                                requeue
                            }
                            .boxed(),
                        );
                    }
                }
                Some(requeue) = self.delayed.next(), if !self.delayed.is_empty() => {
                    for operation in requeue {
                        self.push(operation);
                    }
                    if !accepting {
                        self.seal();
                    }
                }
            }
        }

        debug!("Multi-search processor drained");
        let _ = done.send(true);
    }

    fn push(&mut self, operation: Operation) {
        self.window.push(operation);
        if self.window.len() == 1 {
            self.deadline = Some(Instant::now() + self.flush_interval);
        }
        if self.window.len() >= self.operations {
            self.seal();
        }
    }

    fn seal(&mut self) {
        if !self.window.is_empty() {
            self.sealed.push_back(std::mem::take(&mut self.window));
        }
        self.deadline = None;
    }

    fn dispatch_sealed(&mut self) {
        while self.in_flight.len() < self.concurrency {
            let Some(batch) = self.sealed.pop_front() else {
                break;
            };
            self.in_flight.push(
                send_batch(
                    self.transport.clone(),
                    self.options.clone(),
                    batch,
                    self.retries,
                )
                .boxed(),
            );
        }
    }

    fn is_idle(&self) -> bool {
        self.window.is_empty()
            && self.sealed.is_empty()
            && self.in_flight.is_empty()
            && self.delayed.is_empty()
    }
}

/// Send one window and resolve its searches; returns the ones to requeue
async fn send_batch(
    transport: Transport,
    options: RequestOptions,
    batch: Vec<Operation>,
    retries: u32,
) -> Vec<Operation> {
    metrics::record_msearch_batch(batch.len());
    debug!(size = batch.len(), "Sending msearch batch");

    let lines: Vec<Value> = batch
        .iter()
        .flat_map(|op| [op.header.clone(), op.body.clone()])
        .collect();
    let params = RequestParams::new(Method::POST, "/_msearch").with_body(RequestBody::Bulk(lines));

    let response = match transport.request(params, options).await {
        Ok(response) => response,
        Err(error) => {
            for operation in batch {
                operation.resolve(Err(error.clone()));
            }
            return Vec::new();
        }
    };

    let mut responses = match response.body {
        Value::Object(mut body) => match body.remove("responses") {
            Some(Value::Array(items)) => items.into_iter(),
            _ => Vec::new().into_iter(),
        },
        _ => Vec::new().into_iter(),
    };

    let mut requeue = Vec::new();
    for (position, mut operation) in batch.into_iter().enumerate() {
        let Some(item) = responses.next() else {
            operation.resolve(Err(TransportError::Deserialization(format!(
                "Missing msearch response for search {}",
                position
            ))));
            continue;
        };

        let status = item
            .get("status")
            .map(|status| {
                status
                    .as_u64()
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(500)
            })
            .unwrap_or(if item.get("error").is_some() { 500 } else { 200 });

        if status == 429 && operation.requeues < retries {
            operation.requeues += 1;
            requeue.push(operation);
        } else if status >= 400 {
            operation.resolve(Err(TransportError::response(status, item)));
        } else {
            operation.resolve(Ok(SearchResult::from_item(item)));
        }
    }

    if !requeue.is_empty() {
        debug!(count = requeue.len(), "Requeueing throttled searches");
        metrics::record_msearch_requeued(requeue.len());
    }
    requeue
}
