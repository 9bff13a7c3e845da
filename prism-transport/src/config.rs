//! Transport configuration

use crate::error::{Result, TransportError};
use crate::pool::{ResurrectStrategy, SelectorKind};
use crate::serializer::ProtectionBypass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Client name reported in every notification
    #[serde(default = "default_name")]
    pub name: String,

    /// Seed node URLs
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Retries after a transport-level failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Timeout of the resurrection health probe in milliseconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Sniff the cluster topology before the first request
    #[serde(default)]
    pub sniff_on_start: bool,

    /// Sniff the cluster topology after a connection failure
    #[serde(default)]
    pub sniff_on_connection_fault: bool,

    /// Sniff again once this many milliseconds passed since the last sniff
    #[serde(default)]
    pub sniff_interval_ms: Option<u64>,

    /// Path of the topology endpoint
    #[serde(default = "default_sniff_endpoint")]
    pub sniff_endpoint: String,

    /// How dead nodes are brought back
    #[serde(default)]
    pub resurrect_strategy: ResurrectStrategy,

    /// Base of the exponential resurrect backoff in milliseconds
    #[serde(default = "default_resurrect_timeout")]
    pub resurrect_timeout_ms: u64,

    /// Maximum exponent of the resurrect backoff
    #[serde(default = "default_resurrect_timeout_cutoff")]
    pub resurrect_timeout_cutoff: u32,

    /// Node selection strategy
    #[serde(default)]
    pub node_selector: SelectorKind,

    /// Response statuses that are retried on another node
    #[serde(default)]
    pub retry_on_status: Vec<u16>,

    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Default context attached to request metadata
    #[serde(default)]
    pub context: Option<serde_json::Value>,

    /// TLS settings for HTTPS nodes
    #[serde(default)]
    pub tls: TlsConfig,

    /// Disable reserved-key protection when decoding responses
    #[serde(default)]
    pub disable_prototype_poisoning_protection: ProtectionBypass,
}

fn default_name() -> String {
    "prism-client".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30000
}

fn default_ping_timeout() -> u64 {
    3000
}

fn default_sniff_endpoint() -> String {
    "_nodes/_all/http".to_string()
}

fn default_resurrect_timeout() -> u64 {
    60000
}

fn default_resurrect_timeout_cutoff() -> u32 {
    5
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            nodes: Vec::new(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            sniff_on_start: false,
            sniff_on_connection_fault: false,
            sniff_interval_ms: None,
            sniff_endpoint: default_sniff_endpoint(),
            resurrect_strategy: ResurrectStrategy::default(),
            resurrect_timeout_ms: default_resurrect_timeout(),
            resurrect_timeout_cutoff: default_resurrect_timeout_cutoff(),
            node_selector: SelectorKind::default(),
            retry_on_status: Vec::new(),
            headers: BTreeMap::new(),
            context: None,
            tls: TlsConfig::default(),
            disable_prototype_poisoning_protection: ProtectionBypass::default(),
        }
    }
}

/// TLS configuration for HTTPS nodes
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Extra CA certificate (PEM) trusted for node certificates
    pub ca_cert_path: Option<PathBuf>,

    /// Skip certificate verification (INSECURE - for development only)
    #[serde(default)]
    pub skip_verify: bool,
}

impl TransportConfig {
    /// Config with the given seed nodes and defaults for everything else
    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Load and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it; `.yaml`/`.yml` is read as
    /// YAML, anything else as TOML
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Configuration(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| {
                TransportError::Configuration(format!("Invalid YAML config: {}", e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                TransportError::Configuration(format!("Invalid TOML config: {}", e))
            })?
        };

        Ok(config)
    }

    /// Reject configurations the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TransportError::Configuration(
                "Missing node(s) option".to_string(),
            ));
        }
        if self.sniff_endpoint.trim().is_empty() {
            return Err(TransportError::Configuration(
                "sniff_endpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get ping timeout as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Get resurrect backoff base as Duration
    pub fn resurrect_timeout(&self) -> Duration {
        Duration::from_millis(self.resurrect_timeout_ms)
    }

    /// Get sniff interval as Duration
    pub fn sniff_interval(&self) -> Option<Duration> {
        self.sniff_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.name, "prism-client");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.resurrect_timeout(), Duration::from_secs(60));
        assert_eq!(config.resurrect_strategy, ResurrectStrategy::Ping);
        assert_eq!(config.node_selector, SelectorKind::RoundRobin);
        assert!(config.sniff_interval().is_none());
    }

    #[test]
    fn test_validate_requires_nodes() {
        let err = TransportConfig::default().validate().unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
        assert!(TransportConfig::with_nodes(["http://localhost:9200"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
name = "search-frontend"
nodes = ["http://10.0.0.1:9200", "http://10.0.0.2:9200"]
max_retries = 1
sniff_on_connection_fault = true
resurrect_strategy = "optimistic"
node_selector = "random"
"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "search-frontend");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.max_retries, 1);
        assert!(config.sniff_on_connection_fault);
        assert_eq!(config.resurrect_strategy, ResurrectStrategy::Optimistic);
        assert_eq!(config.node_selector, SelectorKind::Random);
        assert_eq!(config.ping_timeout_ms, 3000);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "nodes:\n  - http://localhost:9200\nsniff_interval_ms: 30000\nretry_on_status: [502, 503]"
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.sniff_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.retry_on_status, vec![502, 503]);
    }

    #[test]
    fn test_from_file_rejects_empty_nodes() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "name = \"empty\"").unwrap();
        assert!(TransportConfig::from_file(file.path()).is_err());

        let config = TransportConfig::read_file(file.path()).unwrap();
        assert_eq!(config.name, "empty");
        assert!(config.nodes.is_empty());
    }
}
