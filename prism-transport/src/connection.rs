//! Physical HTTP exchange with a single node
//!
//! [`HttpConnection`] is the reqwest-backed default. The pool and the
//! dispatcher only depend on the [`Connection`] trait, so tests can script
//! node behaviour without sockets.

use crate::config::TlsConfig;
use crate::error::{Result, TransportError};
use crate::node::Node;
use async_trait::async_trait;
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

/// One attempt against one node
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub method: Method,
    pub path: String,
    /// Already-encoded query string, without the leading `?`
    pub querystring: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
}

impl ConnectionRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: String::new(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Lightweight health probe used by resurrection
    pub fn ping(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::new(Method::HEAD, "/")
        }
    }
}

/// Undecoded HTTP response
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Response with a JSON content type
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        response
    }

    pub fn is_json(&self) -> bool {
        self.headers
            .get("content-type")
            .is_some_and(|ct| ct.contains("application/json") || ct.contains("+json"))
    }
}

/// Sends one request to one node
#[async_trait]
pub trait Connection: Send + Sync {
    /// Transport-level failures must come back as
    /// [`TransportError::Connection`] or [`TransportError::Timeout`];
    /// any HTTP status is a successful exchange.
    async fn request(&self, node: &Node, request: &ConnectionRequest) -> Result<RawResponse>;
}

/// Build the full URL of a request against a node, keeping any path prefix
pub fn request_url(node: &Node, request: &ConnectionRequest) -> String {
    let base = node.url().as_str().trim_end_matches('/');
    let path = request.path.trim_start_matches('/');
    if request.querystring.is_empty() {
        format!("{}/{}", base, path)
    } else {
        format!("{}/{}?{}", base, path, request.querystring)
    }
}

/// reqwest-backed connection shared by every node
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: reqwest::Client,
}

impl HttpConnection {
    /// Create a connection with the given TLS settings
    pub fn new(tls: &TlsConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(tls.skip_verify);

        if let Some(ca_path) = &tls.ca_cert_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                TransportError::Configuration(format!(
                    "Failed to read CA certificate {}: {}",
                    ca_path.display(),
                    e
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                TransportError::Configuration(format!("Invalid CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().map_err(|e| {
            TransportError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self { client })
    }

    /// Wrap an existing reqwest client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn request(&self, node: &Node, request: &ConnectionRequest) -> Result<RawResponse> {
        let url = request_url(node, request);
        debug!(node = %node.id(), method = %request.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);

        for (name, value) in node.headers().iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| map_reqwest_error(&url, e))?;

        trace!(node = %node.id(), status, bytes = body.len(), "Received response");
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(format!("Request to {} timed out", url))
    } else if err.is_builder() {
        TransportError::Configuration(format!("Invalid request to {}: {}", url, err))
    } else {
        TransportError::Connection(format!("Request to {} failed: {}", url, err))
    }
}
