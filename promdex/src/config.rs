//! Adapter configuration.
//!
//! Loaded once at startup from a YAML file. Every field has a default, so an
//! empty file yields a working configuration against a local node.
//!
//! ```yaml
//! nodes:
//!   - host: 10.0.0.1
//!     port: 9200
//! user: elastic
//! password: changeme
//! index: prometheus
//! workers: 4
//! bulk_size_mb: 5
//! query_size: 5000
//! max_results: 100000
//! scroll_keep_alive: 3m
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ConfigError;

/// Largest page size the backend accepts for a single search request.
pub const MAX_QUERY_SIZE: usize = 10_000;

/// One backend node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9200,
        }
    }
}

/// Configuration of the storage backend and the translation core.
///
/// Immutable after startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Backend nodes, tried in order.
    pub nodes: Vec<NodeConfig>,
    /// URL scheme used to reach the nodes.
    pub scheme: String,
    /// Basic-auth user.
    pub user: String,
    /// Basic-auth password.
    pub password: String,
    /// Target index.
    pub index: String,
    /// Ping the cluster when connecting.
    pub healthcheck: bool,
    /// Number of concurrent bulk workers per write.
    pub workers: usize,
    /// Buffered bytes per worker that trigger a commit, in MiB.
    pub bulk_size_mb: usize,
    /// Transport-level retries per bulk commit.
    pub bulk_retries: u32,
    /// Bounded submission queue length per bulk worker.
    pub queue_capacity: usize,
    /// Scroll page size.
    pub query_size: usize,
    /// Maximum samples returned per query; zero or negative is unlimited.
    pub max_results: i64,
    /// Scroll cursor lease, e.g. `3m`.
    pub scroll_keep_alive: String,
    /// HTTP request timeout, e.g. `30s`.
    pub request_timeout: String,
    /// JSON mapping applied when the index is created.
    pub mapping_path: PathBuf,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::default()],
            scheme: "http".to_string(),
            user: "elastic".to_string(),
            password: "changeme".to_string(),
            index: "prometheus".to_string(),
            healthcheck: false,
            workers: 1,
            bulk_size_mb: 1,
            bulk_retries: 0,
            queue_capacity: 1000,
            query_size: 5000,
            max_results: -1,
            scroll_keep_alive: "3m".to_string(),
            request_timeout: "30s".to_string(),
            mapping_path: PathBuf::from("mapping.json"),
        }
    }
}

impl AdapterConfig {
    /// Checks every field, returning the first problem found.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidNode` or `ConfigError::InvalidValue`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "nodes",
                reason: "at least one node is required".to_string(),
            });
        }
        for node in &self.nodes {
            validate_node(node)?;
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::InvalidValue {
                field: "scheme",
                reason: format!("expected http or https, got '{}'", self.scheme),
            });
        }
        if self.index.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "index",
                reason: "must not be empty".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.bulk_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bulk_size_mb",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.query_size == 0 || self.query_size > MAX_QUERY_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "query_size",
                reason: format!("must be between 1 and {MAX_QUERY_SIZE}, got {}", self.query_size),
            });
        }
        self.keep_alive()?;
        self.timeout()?;
        Ok(())
    }

    /// Base URLs of all nodes.
    pub fn node_urls(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| format!("{}://{}:{}", self.scheme, n.host, n.port))
            .collect()
    }

    /// Commit threshold in bytes.
    pub fn flush_bytes(&self) -> usize {
        self.bulk_size_mb << 20
    }

    /// Result cap, or `None` when unlimited.
    pub fn max_results(&self) -> Option<usize> {
        usize::try_from(self.max_results).ok().filter(|&n| n > 0)
    }

    /// Scroll lease duration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the string is not a duration.
    pub fn keep_alive(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.scroll_keep_alive).map_err(|reason| ConfigError::InvalidValue {
            field: "scroll_keep_alive",
            reason,
        })
    }

    /// HTTP request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the string is not a duration.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.request_timeout).map_err(|reason| ConfigError::InvalidValue {
            field: "request_timeout",
            reason,
        })
    }

    /// Reads the mapping file, falling back to [`default_mapping`] when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read or parsed.
    pub fn load_mapping(&self) -> Result<Value, ConfigError> {
        let path = &self.mapping_path;
        if !path.exists() {
            tracing::info!(
                mapping_path = %path.display(),
                "mapping file not found, using built-in mapping"
            );
            return Ok(default_mapping());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::MappingRead {
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::MappingParse {
            path: path.clone(),
            source: e,
        })
    }

    /// Logs the effective configuration. The password is never logged.
    pub fn log_summary(&self) {
        for url in self.node_urls() {
            tracing::info!(node = %url, "node joins cluster");
        }
        tracing::info!(
            user = %self.user,
            index = %self.index,
            healthcheck = self.healthcheck,
            workers = self.workers,
            bulk_size_mb = self.bulk_size_mb,
            bulk_retries = self.bulk_retries,
            query_size = self.query_size,
            max_results = self.max_results,
            scroll_keep_alive = %self.scroll_keep_alive,
            mapping_path = %self.mapping_path.display(),
            "adapter configuration"
        );
    }
}

/// Loads and validates the configuration from a YAML file.
///
/// A relative `mapping_path` is resolved against the directory containing
/// the configuration file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AdapterConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    // serde_yaml rejects an empty document for a struct
    let mut config: AdapterConfig = if contents.trim().is_empty() {
        AdapterConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?
    };

    if config.mapping_path.is_relative()
        && let Some(dir) = path.parent()
    {
        config.mapping_path = dir.join(&config.mapping_path);
    }

    config.validate()?;
    Ok(config)
}

/// Mapping used when no mapping file is provided: every label gets a keyword
/// sub-field, values are doubles and timestamps are epoch milliseconds.
pub fn default_mapping() -> Value {
    json!({
        "dynamic_templates": [{
            "labels": {
                "path_match": "labels.*",
                "match_mapping_type": "string",
                "mapping": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword", "ignore_above": 1024 }
                    }
                }
            }
        }],
        "properties": {
            "value": { "type": "double" },
            "timestamp": { "type": "date", "format": "epoch_millis" }
        }
    })
}

fn validate_node(node: &NodeConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidNode {
        node: format!("{}:{}", node.host, node.port),
        reason: reason.to_string(),
    };

    if node.host.is_empty() {
        return Err(invalid("host must not be empty"));
    }
    if node
        .host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '@'))
    {
        return Err(invalid("host must be a bare host name or address"));
    }
    if node.port == 0 {
        return Err(invalid("port must be non-zero"));
    }
    Ok(())
}

/// Parses a duration string such as `500ms`, `30s`, `3m`, `1h` or `1d`.
///
/// # Errors
///
/// Returns a description of the problem if the string is malformed.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let num_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if num_end == 0 {
        return Err(format!("duration '{s}' must start with a number"));
    }

    let value: u64 = s[..num_end]
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;

    let secs = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    };
    let duration = match &s[num_end..] {
        "ms" => Duration::from_millis(value),
        "s" | "" => Duration::from_secs(value),
        "m" => secs(60)?,
        "h" => secs(3600)?,
        "d" => secs(86400)?,
        unit => return Err(format!("unknown duration unit '{unit}' in '{s}'")),
    };

    if duration.is_zero() {
        return Err(format!("duration '{s}' must be positive"));
    }
    Ok(duration)
}
