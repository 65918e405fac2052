//! # iproto Cluster Client
//!
//! Purpose: An async client for the binary iproto protocol that multiplexes
//! requests over pooled connections to a cluster of instances.
//!
//! ## Design Principles
//! 1. **Multiplexing**: Many in-flight requests share one socket; responses
//!    are matched by sync id, never by arrival order.
//! 2. **Self-Healing Pool**: Dropped connections reconnect per slot, the
//!    heartbeat takes sick ones out of rotation, and the balancer only ever
//!    hands out Ready connections.
//! 3. **Schema Aware**: Space and index names resolve through a versioned
//!    metadata cache that refetches when the server schema moves.
//! 4. **Explicit Ownership**: Runtime, metrics, and hooks are passed in at
//!    construction; nothing is global.

pub mod balancer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod group;
pub mod heartbeat;
pub mod metrics;
pub mod pool;
pub mod resource;
pub mod schema;
pub mod stream;
pub mod tls;
pub mod waiter;
pub mod watch;

pub use balancer::{Balancer, BalancerPolicy, PolicyRegistry, DISTRIBUTING, ROUND_ROBIN, TAG_ROUND_ROBIN};
pub use client::Client;
pub use config::{
    ClientConfig, ClientHooks, HealthCheckMode, HeartbeatConfig, SchemaConfig, SchemaVersionPolicy,
    TlsConfig, WatcherConfig,
};
pub use connection::{Connection, ConnectionContext, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use factory::ConnectionFactory;
pub use group::InstanceConnectionGroup;
pub use heartbeat::{HeartbeatMonitor, HeartbeatWindow, Verdict};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolConfig, PoolEvent, PoolEventListener};
pub use resource::{IoRuntime, ManagedResource};
pub use schema::{SchemaFetcher, Space};
pub use stream::Stream;
pub use waiter::{RequestOptions, Response, ResponseFormat, ResponseFuture};
pub use watch::{WatchCallback, WatchEvent};

pub use iproto_common::{IteratorType, RequestTarget, SelectParams};
