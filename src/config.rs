//! Configuration
//!
//! Settings are a flat mapping of dotted names to values. They are loaded
//! from a TOML file whose dotted keys are flattened back into single names,
//! so both of these spell the same setting:
//!
//! ```text
//! metaServer.clientSM.maxPendingOps = 16
//!
//! [metaServer.clientSM]
//! maxPendingOps = 16
//! ```
//!
//! Command line `-D name=value` definitions are layered on top.
//!
//! Two views are derived from the mapping:
//!
//! - [`Policy`]: the per-connection flow-control ceilings. Shared
//!   process-wide through a [`SharedPolicy`] and re-read by every connection
//!   at the start of each turn, so a reload takes effect without reconnects.
//! - [`ServerConfig`]: listener address and worker fan-out, read once.

use crate::protocol::MAX_RPC_HEADER_LEN;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const MAX_PENDING_OPS: &str = "metaServer.clientSM.maxPendingOps";
pub const MAX_PENDING_BYTES: &str = "metaServer.clientSM.maxPendingBytes";
pub const MAX_READ_AHEAD: &str = "metaServer.clientSM.maxReadAhead";
pub const INACTIVITY_TIMEOUT: &str = "metaServer.clientSM.inactivityTimeout";
pub const MAX_WRITE_BEHIND: &str = "metaServer.clientSM.maxWriteBehind";
pub const BUF_COMPACTION_THRESHOLD: &str = "metaServer.clientSM.bufCompactionThreshold";
pub const OUT_BUF_COMPACTION_THRESHOLD: &str = "metaServer.clientSM.outBufCompactionThreshold";
pub const AUDIT_LOGGING: &str = "metaServer.clientSM.auditLogging";
pub const RESUBMIT_INTERVAL_MS: &str = "metaServer.clientSM.resubmitIntervalMs";
pub const CLIENT_HOST: &str = "metaServer.clientHost";
pub const CLIENT_PORT: &str = "metaServer.clientPort";
pub const CLIENT_THREAD_COUNT: &str = "metaServer.clientThreadCount";
pub const CLIENT_THREAD_QUEUE_SIZE: &str = "metaServer.clientThreadQueueSize";

/// Pending ops ceiling used when worker threads are configured but no
/// explicit ceiling is.
const THREADED_MAX_PENDING_OPS: usize = 16;

/// Smallest read-ahead that still lets a typical request in with one read
const MIN_READ_AHEAD: usize = 256;

/// Smallest unparsed-input ceiling: one byte over the header limit, so an
/// incomplete header can always grow until the codec rejects it.
pub const MIN_PENDING_BYTES: usize = MAX_RPC_HEADER_LEN + 1;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid definition {0:?}, expected name=value")]
    Definition(String),
}

/// Flat `name -> value` settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses TOML text, flattening nested tables into dotted names.
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = text.parse()?;
        let mut props = Self::new();
        flatten("", &table, &mut props.values);
        Ok(props)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_str(&text)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Applies a `name=value` definition.
    pub fn define(&mut self, definition: &str) -> Result<(), ConfigError> {
        let (name, value) = definition
            .split_once('=')
            .ok_or_else(|| ConfigError::Definition(definition.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Definition(definition.to_string()));
        }
        self.set(name, value.trim());
        Ok(())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns the parsed value of `name`, or `default` when it is absent or
    /// does not parse.
    pub fn get<T: FromStr>(&self, name: &str, default: T) -> T {
        match self.values.get(name) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    warn!(name = name, value = %raw, "Ignoring unparseable setting");
                    default
                }
            },
            None => default,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten(&name, inner, out),
            toml::Value::String(s) => {
                out.insert(name, s.clone());
            }
            toml::Value::Integer(n) => {
                out.insert(name, n.to_string());
            }
            toml::Value::Float(f) => {
                out.insert(name, f.to_string());
            }
            toml::Value::Boolean(b) => {
                out.insert(name, if *b { "1" } else { "0" }.to_string());
            }
            other => {
                warn!(name = %name, kind = other.type_str(), "Ignoring non-scalar setting");
            }
        }
    }
}

/// Per-connection flow-control ceilings.
///
/// All ceilings are soft except the codec's header size limit: exceeding one
/// suppresses reads until the backlog drains, it never drops data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Requests in flight per connection
    pub max_pending_ops: usize,
    /// Unparsed input bytes before reads are suppressed
    pub max_pending_bytes: usize,
    /// Bytes a single read may add to the inbound buffer
    pub max_read_ahead: usize,
    /// Idle time before the connection is closed; `None` disables
    pub inactivity_timeout: Option<Duration>,
    /// Unflushed output bytes before parsing is suppressed
    pub max_write_behind: usize,
    /// Compact the inbound buffer when at most this many bytes remain
    pub buf_compaction_threshold: usize,
    /// Compact the outbound buffer when at most this many bytes remain
    pub out_buf_compaction_threshold: usize,
    /// Retain request headers and pass completed requests to the audit log
    pub audit_logging: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_pending_ops: 1,
            max_pending_bytes: MIN_PENDING_BYTES,
            max_read_ahead: 3 << 10,
            inactivity_timeout: Some(Duration::from_secs(8 * 60)),
            max_write_behind: 3 << 10,
            buf_compaction_threshold: 1 << 10,
            out_buf_compaction_threshold: 8 << 10,
            audit_logging: false,
        }
    }
}

impl Policy {
    /// Returns a copy of this policy with the settings present in `props`
    /// applied. Absent settings keep their current values.
    pub fn with_properties(&self, props: &Properties) -> Self {
        let mut policy = self.clone();

        let max_pending_ops: i64 = props.get(MAX_PENDING_OPS, -1);
        if max_pending_ops > 0 {
            policy.max_pending_ops = max_pending_ops as usize;
        } else if props.get::<i64>(CLIENT_THREAD_COUNT, -1) > 0 {
            policy.max_pending_ops = THREADED_MAX_PENDING_OPS;
        }
        policy.max_pending_bytes = props
            .get(MAX_PENDING_BYTES, policy.max_pending_bytes as i64)
            .max(MIN_PENDING_BYTES as i64) as usize;
        policy.max_read_ahead = props
            .get(MAX_READ_AHEAD, policy.max_read_ahead as i64)
            .max(MIN_READ_AHEAD as i64) as usize;
        let current_timeout = policy
            .inactivity_timeout
            .map_or(-1, |t| t.as_secs() as i64);
        let timeout: i64 = props.get(INACTIVITY_TIMEOUT, current_timeout);
        policy.inactivity_timeout = (timeout > 0).then(|| Duration::from_secs(timeout as u64));
        policy.max_write_behind = props
            .get(MAX_WRITE_BEHIND, policy.max_write_behind as i64)
            .max(1) as usize;
        policy.buf_compaction_threshold = props
            .get(BUF_COMPACTION_THRESHOLD, policy.buf_compaction_threshold as i64)
            .max(0) as usize;
        policy.out_buf_compaction_threshold = props
            .get(
                OUT_BUF_COMPACTION_THRESHOLD,
                policy.out_buf_compaction_threshold as i64,
            )
            .max(0) as usize;
        policy.audit_logging = props.get::<i64>(AUDIT_LOGGING, policy.audit_logging as i64) != 0;
        policy
    }
}

/// The process-wide policy, swapped atomically on reload.
pub type SharedPolicy = Arc<ArcSwap<Policy>>;

pub fn shared_policy(policy: Policy) -> SharedPolicy {
    Arc::new(ArcSwap::from_pointee(policy))
}

/// Applies `props` on top of the current policy and publishes the result.
pub fn reload_policy(shared: &SharedPolicy, props: &Properties) -> Arc<Policy> {
    let updated = Arc::new(shared.load().with_properties(props));
    shared.store(Arc::clone(&updated));
    updated
}

/// Listener and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Worker lanes; each connection is pinned to one
    pub client_threads: usize,
    /// Queued requests per worker lane before submissions are rejected
    pub queue_depth: usize,
    /// How soon a rejected submission is offered again
    pub resubmit_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            client_threads: 1,
            queue_depth: 1024,
            resubmit_interval: Duration::from_millis(1),
        }
    }
}

impl ServerConfig {
    pub fn from_properties(props: &Properties) -> Self {
        let defaults = Self::default();
        Self {
            host: props
                .get_str(CLIENT_HOST)
                .map_or(defaults.host, str::to_string),
            port: props.get(CLIENT_PORT, defaults.port),
            client_threads: props.get::<usize>(CLIENT_THREAD_COUNT, 0).max(1),
            queue_depth: props.get::<usize>(CLIENT_THREAD_QUEUE_SIZE, defaults.queue_depth).max(1),
            resubmit_interval: Duration::from_millis(
                props.get::<u64>(RESUBMIT_INTERVAL_MS, 1).max(1),
            ),
        }
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_dotted_and_nested_keys() {
        let props = Properties::parse_str(
            r#"
            [metaServer]
            clientPort = 20000
            clientSM.maxPendingOps = 16
            clientSM.auditLogging = true
            "#,
        )
        .unwrap();
        assert_eq!(props.get_str(CLIENT_PORT), Some("20000"));
        assert_eq!(props.get_str(MAX_PENDING_OPS), Some("16"));
        assert_eq!(props.get_str(AUDIT_LOGGING), Some("1"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Properties::parse_str("metaServer.clientPort = "),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_define() {
        let mut props = Properties::new();
        props.define("metaServer.clientSM.maxWriteBehind = 8192").unwrap();
        assert_eq!(props.get(MAX_WRITE_BEHIND, 0usize), 8192);
        assert!(props.define("novalue").is_err());
        assert!(props.define("=5").is_err());
    }

    #[test]
    fn test_get_falls_back_on_garbage() {
        let mut props = Properties::new();
        props.set(CLIENT_PORT, "not-a-port");
        assert_eq!(props.get(CLIENT_PORT, 7u16), 7);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.max_pending_ops, 1);
        assert_eq!(policy.max_pending_bytes, MIN_PENDING_BYTES);
        assert_eq!(policy.max_read_ahead, 3072);
        assert_eq!(policy.inactivity_timeout, Some(Duration::from_secs(480)));
        assert_eq!(policy.max_write_behind, 3072);
        assert_eq!(policy.buf_compaction_threshold, 1024);
        assert_eq!(policy.out_buf_compaction_threshold, 8192);
        assert!(!policy.audit_logging);
    }

    #[test]
    fn test_policy_clamps() {
        let mut props = Properties::new();
        props.set(MAX_PENDING_BYTES, "0");
        props.set(MAX_READ_AHEAD, "10");
        props.set(MAX_WRITE_BEHIND, "-4");
        props.set(INACTIVITY_TIMEOUT, "-1");
        let policy = Policy::default().with_properties(&props);
        assert_eq!(policy.max_pending_bytes, MAX_RPC_HEADER_LEN + 1);
        assert_eq!(policy.max_read_ahead, 256);
        assert_eq!(policy.max_write_behind, 1);
        assert_eq!(policy.inactivity_timeout, None);

        props.set(MAX_PENDING_BYTES, "65536");
        let policy = Policy::default().with_properties(&props);
        assert_eq!(policy.max_pending_bytes, 65536);
    }

    #[test]
    fn test_thread_count_raises_pending_ops() {
        let mut props = Properties::new();
        props.set(CLIENT_THREAD_COUNT, "4");
        assert_eq!(Policy::default().with_properties(&props).max_pending_ops, 16);

        props.set(MAX_PENDING_OPS, "3");
        assert_eq!(Policy::default().with_properties(&props).max_pending_ops, 3);
    }

    #[test]
    fn test_reload_keeps_unset_values() {
        let shared = shared_policy(Policy::default());
        let mut first = Properties::new();
        first.set(MAX_WRITE_BEHIND, "9000");
        first.set(AUDIT_LOGGING, "1");
        reload_policy(&shared, &first);

        let mut second = Properties::new();
        second.set(MAX_PENDING_OPS, "8");
        let policy = reload_policy(&shared, &second);
        assert_eq!(policy.max_write_behind, 9000);
        assert!(policy.audit_logging);
        assert_eq!(policy.max_pending_ops, 8);
        assert_eq!(*shared.load_full(), *policy);
    }

    #[test]
    fn test_server_config() {
        let mut props = Properties::new();
        props.set(CLIENT_HOST, "0.0.0.0");
        props.set(CLIENT_PORT, "30000");
        props.set(CLIENT_THREAD_COUNT, "0");
        let config = ServerConfig::from_properties(&props);
        assert_eq!(config.bind_address(), "0.0.0.0:30000");
        assert_eq!(config.client_threads, 1);
        assert_eq!(config.queue_depth, 1024);
    }
}
