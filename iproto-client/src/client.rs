//! # Cluster Client
//!
//! Purpose: The public entry point. Wires the runtime, connection factory,
//! pool, balancer, heartbeat, and schema cache together and exposes the
//! primitive operations.
//!
//! ## Design Principles
//! 1. **Select Then Send**: Every operation asks the balancer for a Ready
//!    connection and sends on it; nothing here blocks a thread.
//! 2. **Names Resolve Through The Cache**: With schema fetching on, space and
//!    index names become numeric ids before sending, and the request is
//!    stamped with the schema version they came from. With it off, names go
//!    to the connection, which rejects them if the server lacks the feature.
//! 3. **Close Releases Only What It Owns**: The I/O runtime is shut down on
//!    close only when the client built it.
//!
//! ## Request Path
//!
//! ```text
//! Client::select("users", "by_name", ..)
//!   ─► SchemaFetcher::resolve ─► (space_id, index_id, version)
//!   ─► Balancer::get_next ─► Connection::select(ById, ById)
//!   ─► process_request: 109 ⇒ invalidate + retry / mismatch error
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use iproto_common::{RequestTarget, SelectParams};
use parking_lot::Mutex;
use rmpv::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::balancer::{Balancer, PolicyRegistry};
use crate::config::{ClientConfig, ClientHooks};
use crate::connection::{Connection, ConnectionContext};
use crate::error::ClientResult;
use crate::factory::ConnectionFactory;
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::ClientMetrics;
use crate::pool::{ConnectionPool, PoolConfig, PoolEvent};
use crate::resource::{IoRuntime, ManagedResource};
use crate::schema::{SchemaFetcher, SchemaVersionTracker};
use crate::stream::Stream;
use crate::waiter::{RequestOptions, Response, ResponseFuture};
use crate::watch::{WatchCallback, WatchDispatcher, WatchEvent};

struct ClientInner {
    config: ClientConfig,
    runtime: Mutex<Option<ManagedResource<IoRuntime>>>,
    pool: ConnectionPool,
    balancer: Arc<Balancer>,
    schema: Option<Arc<SchemaFetcher>>,
    heartbeat: Option<HeartbeatMonitor>,
    metrics: Option<Arc<ClientMetrics>>,
}

/// Client handle; cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connects with default hooks and an owned I/O runtime.
    pub async fn connect(config: ClientConfig) -> ClientResult<Client> {
        Client::connect_with_hooks(config, ClientHooks::default()).await
    }

    /// Validates the configuration, connects every group, and starts the
    /// heartbeat if configured.
    ///
    /// **Output**: a client with at least one Ready connection, or the first
    /// connection error when none could be established.
    pub async fn connect_with_hooks(config: ClientConfig, hooks: ClientHooks) -> ClientResult<Client> {
        config.validate()?;
        let policy = PolicyRegistry::default().build(&config)?;
        if let Some(metrics) = &hooks.metrics {
            metrics.attach()?;
        }

        let runtime = match hooks.runtime.clone() {
            Some(handle) => IoRuntime::borrowed(handle),
            None => IoRuntime::owned(config.io_threads)?,
        };
        let handle: Handle = runtime.get().handle().clone();

        let tracker = Arc::new(SchemaVersionTracker::new());
        let context = ConnectionContext {
            handle: handle.clone(),
            request_timeout: config.request_timeout(),
            max_frame: config.max_frame_size,
            ignored_packet: hooks.ignored_packet.clone(),
            metrics: hooks.metrics.clone(),
            schema_versions: tracker.clone(),
            dispatcher: WatchDispatcher::spawn(&handle, config.watchers.queue_capacity),
        };
        let factory = ConnectionFactory::new(context, &config)?;
        let pool = ConnectionPool::start(
            &config.groups,
            factory,
            PoolConfig::from_client(&config),
            hooks.pool_listener.clone(),
        )
        .await?;

        let balancer = Arc::new(Balancer::new(pool.clone(), policy, config.connect_timeout()));
        let schema = config
            .schema
            .enabled
            .then(|| Arc::new(SchemaFetcher::new(balancer.clone(), tracker, config.schema.version_policy)));
        let heartbeat = config
            .heartbeat
            .clone()
            .map(|heartbeat| HeartbeatMonitor::start(pool.clone(), heartbeat, &handle));

        info!(
            groups = config.groups.len(),
            connections = pool.size(),
            balancer = balancer.policy_name(),
            owned_runtime = runtime.is_owned(),
            "client connected"
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                runtime: Mutex::new(Some(runtime)),
                pool,
                balancer,
                schema,
                heartbeat,
                metrics: hooks.metrics,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn balancer(&self) -> &Balancer {
        &self.inner.balancer
    }

    /// Schema cache, when schema fetching is enabled.
    pub fn schema(&self) -> Option<&SchemaFetcher> {
        self.inner.schema.as_deref()
    }

    pub fn metrics(&self) -> Option<&ClientMetrics> {
        self.inner.metrics.as_deref()
    }

    pub fn available_connections(&self) -> ClientResult<usize> {
        self.inner.pool.available_connections()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.pool.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Next Ready connection per the balancer policy.
    pub async fn connection(&self) -> ClientResult<Connection> {
        self.inner.balancer.get_next().await
    }

    pub async fn ping(&self, opts: RequestOptions) -> ClientResult<Response> {
        self.connection().await?.ping(opts)?.await
    }

    pub async fn call(&self, function: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<Response> {
        self.connection().await?.call(function, args, opts)?.await
    }

    pub async fn eval(&self, expr: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<Response> {
        self.connection().await?.eval(expr, args, opts)?.await
    }

    pub async fn select(
        &self,
        space: impl Into<RequestTarget>,
        index: impl Into<RequestTarget>,
        key: Vec<Value>,
        params: SelectParams,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let (space, index) = (space.into(), index.into());
        self.dispatch(&space, Some(&index), &opts, |conn, space, index, opts| {
            conn.select(space, index, key.clone(), params, opts)
        })
        .await
    }

    pub async fn insert(
        &self,
        space: impl Into<RequestTarget>,
        tuple: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let space = space.into();
        self.dispatch(&space, None, &opts, |conn, space, _, opts| {
            conn.insert(space, tuple.clone(), opts)
        })
        .await
    }

    pub async fn replace(
        &self,
        space: impl Into<RequestTarget>,
        tuple: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let space = space.into();
        self.dispatch(&space, None, &opts, |conn, space, _, opts| {
            conn.replace(space, tuple.clone(), opts)
        })
        .await
    }

    pub async fn update(
        &self,
        space: impl Into<RequestTarget>,
        index: impl Into<RequestTarget>,
        key: Vec<Value>,
        ops: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let (space, index) = (space.into(), index.into());
        self.dispatch(&space, Some(&index), &opts, |conn, space, index, opts| {
            conn.update(space, index, key.clone(), ops.clone(), opts)
        })
        .await
    }

    pub async fn upsert(
        &self,
        space: impl Into<RequestTarget>,
        tuple: Vec<Value>,
        ops: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let space = space.into();
        self.dispatch(&space, None, &opts, |conn, space, _, opts| {
            conn.upsert(space, tuple.clone(), ops.clone(), opts)
        })
        .await
    }

    pub async fn delete(
        &self,
        space: impl Into<RequestTarget>,
        index: impl Into<RequestTarget>,
        key: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<Response> {
        let (space, index) = (space.into(), index.into());
        self.dispatch(&space, Some(&index), &opts, |conn, space, index, opts| {
            conn.delete(space, index, key.clone(), opts)
        })
        .await
    }

    /// Sends a space/index request, resolving names through the schema cache
    /// when it is enabled.
    async fn dispatch<F>(
        &self,
        space: &RequestTarget,
        index: Option<&RequestTarget>,
        opts: &RequestOptions,
        send: F,
    ) -> ClientResult<Response>
    where
        F: Fn(&Connection, &RequestTarget, &RequestTarget, RequestOptions) -> ClientResult<ResponseFuture>,
    {
        let default_index = RequestTarget::default();
        let by_name = space.is_name() || index.is_some_and(RequestTarget::is_name);
        let schema = match &self.inner.schema {
            Some(schema) if by_name => schema,
            _ => {
                let conn = self.connection().await?;
                return send(&conn, space, index.unwrap_or(&default_index), opts.clone())?.await;
            }
        };

        let balancer = &self.inner.balancer;
        let send = &send;
        schema
            .process_request(move || async move {
                let resolved = schema.resolve(space, index).await?;
                let conn = balancer.get_next().await?;
                let mut opts = opts.clone();
                if resolved.schema_version > 0 {
                    opts.schema_version = Some(resolved.schema_version);
                }
                debug!(
                    space = resolved.space_id,
                    index = resolved.index_id,
                    version = resolved.schema_version,
                    "resolved request target"
                );
                send(
                    &conn,
                    &RequestTarget::ById(resolved.space_id),
                    &RequestTarget::ById(resolved.index_id),
                    opts,
                )?
                .await
            })
            .await
    }

    /// Subscribes `callback` to `key` on every connection, including ones
    /// that reconnect later.
    pub fn watch<F>(&self, key: &str, callback: F) -> ClientResult<()>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        let callback: WatchCallback = Arc::new(callback);
        self.inner.pool.watch(key, callback)
    }

    pub fn unwatch(&self, key: &str) -> ClientResult<()> {
        self.inner.pool.unwatch(key)
    }

    /// Reads the current value of `key` once.
    pub async fn watch_once(&self, key: &str, opts: RequestOptions) -> ClientResult<Response> {
        self.connection().await?.watch_once(key, opts)?.await
    }

    /// Re-authenticates every live connection as `user`.
    pub async fn authorize(&self, user: &str, password: &str) -> ClientResult<()> {
        let mut pending = Vec::new();
        self.inner.pool.for_each(|conn| {
            pending.push(conn.authorize(user, password, RequestOptions::new())?);
            Ok(())
        })?;
        for result in join_all(pending).await {
            result?;
        }
        Ok(())
    }

    /// Opens a stream on the next Ready connection.
    pub async fn stream(&self) -> ClientResult<Stream> {
        self.connection().await?.new_stream()
    }

    /// Closes the pool once, stops the heartbeat, and shuts down the runtime
    /// if the client owns it. Safe to call concurrently.
    pub async fn close(&self) {
        if let Some(heartbeat) = &self.inner.heartbeat {
            heartbeat.stop();
        }
        self.inner.pool.close().await;
        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.release(IoRuntime::shutdown);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("balancer", &self.inner.balancer.policy_name())
            .field("schema", &self.inner.schema.is_some())
            .finish()
    }
}
