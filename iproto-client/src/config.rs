//! # Client Configuration
//!
//! Purpose: Describe everything needed to build a client as plain,
//! serializable data, plus the runtime-only collaborators that cannot be.
//!
//! ## Design Principles
//!
//! 1. **Plain Data**: `ClientConfig` derives serde and round-trips through
//!    JSON; durations are stored as milliseconds.
//! 2. **Validate Once**: `validate()` runs at client construction so invalid
//!    settings never reach a live pool.
//! 3. **Hooks Separate**: Closures, listeners, metrics, and a borrowed
//!    runtime live in `ClientHooks`, which is not serialized.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::balancer::ROUND_ROBIN;
use crate::error::{ClientError, ClientResult};
use crate::group::InstanceConnectionGroup;
use crate::metrics::ClientMetrics;
use crate::pool::PoolEventListener;

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Instance groups; selection order follows this list.
    pub groups: Vec<InstanceConnectionGroup>,
    /// Worker threads of the owned I/O runtime.
    pub io_threads: usize,
    pub connect_timeout_ms: u64,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Delay before a dropped connection slot reconnects.
    pub reconnect_delay_ms: u64,
    /// Drain pending requests before closing sockets.
    pub graceful_shutdown: bool,
    pub graceful_shutdown_grace_ms: u64,
    /// Balancer policy name, resolved through the balancer registry.
    pub balancer: String,
    /// Tag for tag-scoped policies; defaults to the first group.
    pub balancer_tag: Option<String>,
    /// Heartbeat probing; disabled when absent.
    pub heartbeat: Option<HeartbeatConfig>,
    pub schema: SchemaConfig,
    pub watchers: WatcherConfig,
    /// TLS; plain TCP when absent.
    pub tls: Option<TlsConfig>,
    /// Upper bound for one inbound frame.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            groups: Vec::new(),
            io_threads: 2,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 2_000,
            reconnect_delay_ms: 500,
            graceful_shutdown: true,
            graceful_shutdown_grace_ms: 1_000,
            balancer: ROUND_ROBIN.to_string(),
            balancer_tag: None,
            heartbeat: None,
            schema: SchemaConfig::default(),
            watchers: WatcherConfig::default(),
            tls: None,
            max_frame_size: iproto_common::DEFAULT_MAX_FRAME,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with one group and defaults for the rest.
    pub fn new(group: InstanceConnectionGroup) -> Self {
        ClientConfig {
            groups: vec![group],
            ..ClientConfig::default()
        }
    }

    /// Loads a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_group(mut self, group: InstanceConnectionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_balancer(mut self, name: impl Into<String>) -> Self {
        self.balancer = name.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_graceful_shutdown(mut self, enabled: bool, grace: Duration) -> Self {
        self.graceful_shutdown = enabled;
        self.graceful_shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_schema(mut self, schema: SchemaConfig) -> Self {
        self.schema = schema;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn graceful_grace(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_grace_ms)
    }

    /// Rejects settings a pool cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.groups.is_empty() {
            return Err(ClientError::Config("at least one instance group is required".into()));
        }
        let mut tags = HashSet::new();
        for group in &self.groups {
            if group.size == 0 {
                return Err(ClientError::Config(format!("group '{}' has size 0", group.tag)));
            }
            if !tags.insert(group.tag.as_str()) {
                return Err(ClientError::Config(format!("duplicate group tag '{}'", group.tag)));
            }
        }
        if let Some(tag) = &self.balancer_tag {
            if !tags.contains(tag.as_str()) {
                return Err(ClientError::Config(format!("balancer tag '{}' names no group", tag)));
            }
        }
        if self.io_threads == 0 {
            return Err(ClientError::Config("io_threads must be positive".into()));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ClientError::Config("timeouts must be positive".into()));
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        if self.watchers.queue_capacity == 0 {
            return Err(ClientError::Config("watcher queue capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Heartbeat probing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub ping_interval_ms: u64,
    /// Probe outcomes per evaluation window.
    pub window_size: usize,
    /// Invalid probes within a window that make it bad.
    pub invalidation_threshold: usize,
    /// Consecutive bad windows before eviction.
    pub death_threshold: usize,
    /// Timeout of a single probe; defaults to the ping interval.
    pub probe_timeout_ms: Option<u64>,
    pub mode: HealthCheckMode,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            ping_interval_ms: 1_000,
            window_size: 4,
            invalidation_threshold: 2,
            death_threshold: 4,
            probe_timeout_ms: None,
            mode: HealthCheckMode::Ping,
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(self.ping_interval_ms))
    }

    /// Worst-case time from a failure to eviction.
    pub fn detection_time(&self) -> Duration {
        let probes = self.death_threshold.saturating_mul(self.window_size);
        let probes = u32::try_from(probes).unwrap_or(u32::MAX);
        self.ping_interval().checked_mul(probes).unwrap_or(Duration::MAX)
    }

    fn validate(&self) -> ClientResult<()> {
        if self.window_size == 0 || self.ping_interval_ms == 0 {
            return Err(ClientError::Config("heartbeat window and interval must be positive".into()));
        }
        if self.invalidation_threshold == 0 || self.invalidation_threshold > self.window_size {
            return Err(ClientError::Config(
                "invalidation threshold must be within 1..=window_size".into(),
            ));
        }
        if self.death_threshold == 0 {
            return Err(ClientError::Config("death threshold must be positive".into()));
        }
        Ok(())
    }
}

/// What a heartbeat probe sends.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// Bare `PING`.
    #[default]
    Ping,
    /// `CALL` of an application function; an error response is a failed probe.
    Call { function: String },
    /// `EVAL` of an expression; an error response is a failed probe.
    Eval { expr: String },
}

/// How server-reported schema skew is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersionPolicy {
    /// Refetch silently.
    #[default]
    Ignore,
    /// Surface a response older than the cache as an error.
    Strict,
}

/// Schema cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Resolve space/index names client-side through the schema cache.
    pub enabled: bool,
    pub version_policy: SchemaVersionPolicy,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        SchemaConfig {
            enabled: true,
            version_policy: SchemaVersionPolicy::Ignore,
        }
    }
}

/// Watch subscription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Events buffered for the dispatcher before new ones are dropped.
    pub queue_capacity: usize,
    /// Re-send `WATCH` for every registered key on reconnect.
    pub reregister_on_reconnect: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            queue_capacity: 256,
            reregister_on_reconnect: true,
        }
    }
}

/// TLS settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with CA certificates; webpki roots are used when absent.
    pub ca_cert_path: Option<PathBuf>,
    /// SNI override; defaults to the group host.
    pub server_name: Option<String>,
}

/// Callback for frames that matched no pending request: `(tag, index, frame)`.
pub type IgnoredPacketHook = Arc<dyn Fn(&str, usize, &Bytes) + Send + Sync>;

/// Runtime-only collaborators.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub ignored_packet: Option<IgnoredPacketHook>,
    pub pool_listener: Option<Arc<dyn PoolEventListener>>,
    pub metrics: Option<Arc<ClientMetrics>>,
    /// Drive I/O on this runtime instead of an owned one.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl ClientHooks {
    pub fn new() -> Self {
        ClientHooks::default()
    }

    pub fn on_ignored_packet<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, usize, &Bytes) + Send + Sync + 'static,
    {
        self.ignored_packet = Some(Arc::new(hook));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PoolEventListener>) -> Self {
        self.pool_listener = Some(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("ignored_packet", &self.ignored_packet.is_some())
            .field("pool_listener", &self.pool_listener.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}
