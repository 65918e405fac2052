//! # Multiplexed Connection
//!
//! Purpose: Run many concurrent requests over one socket, matching responses
//! to callers by sync id.
//!
//! ## Design Principles
//!
//! 1. **Register Before Write**: A waiter is in the pending table before its
//!    frame is queued, so a fast response always finds it.
//! 2. **Single Writer Task**: Frames go through one unbounded queue and one
//!    task, so bytes hit the socket in submission order and `send_request`
//!    never blocks.
//! 3. **Remove To Complete**: The reader, the timeout timer, and shutdown all
//!    complete a waiter by removing it from the table first; the loser of any
//!    race finds nothing and does nothing.
//! 4. **Unmatched Frames Are Observable**: Anything that matches no waiter
//!    goes to the ignored-packet hook with the connection's tag and index.
//!
//! ## Data Flow
//!
//! ```text
//! caller ──send_request──► pending[sync] = waiter ──► writer queue ──► socket
//! socket ──► reader task ──► pending.remove(sync) ──► waiter.complete()
//!                         └─► (no waiter) ──► ignored-packet hook
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use iproto_common::*;
use parking_lot::{Mutex, RwLock};
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace, warn};

use crate::config::IgnoredPacketHook;
use crate::error::{ClientError, ClientResult};
use crate::metrics::{ClientMetrics, RequestOutcome};
use crate::schema::SchemaVersionTracker;
use crate::stream::Stream;
use crate::waiter::{RequestOptions, Response, ResponseFuture, ResponseWaiter};
use crate::watch::{WatchCallback, WatchDispatcher, WatchEvent};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    SchemaSync = 2,
    Ready = 3,
    /// Alive but excluded from selection (heartbeat invalidation).
    Degraded = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::SchemaSync,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Degraded,
            _ => ConnectionState::Closed,
        }
    }
}

/// Collaborators shared by every connection of one pool.
#[derive(Clone)]
pub struct ConnectionContext {
    pub handle: Handle,
    pub request_timeout: Duration,
    pub max_frame: usize,
    pub ignored_packet: Option<IgnoredPacketHook>,
    pub metrics: Option<Arc<ClientMetrics>>,
    pub schema_versions: Arc<SchemaVersionTracker>,
    pub dispatcher: WatchDispatcher,
}

impl ConnectionContext {
    /// Context with defaults, spawning work on `handle`.
    pub fn new(handle: Handle) -> Self {
        let dispatcher = WatchDispatcher::spawn(&handle, 256);
        ConnectionContext {
            handle,
            request_timeout: Duration::from_secs(2),
            max_frame: DEFAULT_MAX_FRAME,
            ignored_packet: None,
            metrics: None,
            schema_versions: Arc::new(SchemaVersionTracker::new()),
            dispatcher,
        }
    }
}

struct ConnectionInner {
    tag: String,
    index: usize,
    salt: Vec<u8>,
    state: AtomicU8,
    draining: AtomicBool,
    next_sync: AtomicU64,
    next_stream: AtomicU64,
    pending: Mutex<HashMap<u64, ResponseWaiter>>,
    writer: mpsc::UnboundedSender<Bytes>,
    negotiated: RwLock<Negotiated>,
    watchers: Mutex<HashMap<String, WatchCallback>>,
    context: ConnectionContext,
    closed: watch::Sender<bool>,
    drained: Notify,
}

/// Handle to one multiplexed connection; cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Starts the reader and writer tasks over an already-greeted stream.
    ///
    /// The connection starts in `Connecting`; the factory drives it through
    /// the handshake states.
    pub fn spawn<S>(
        stream: S,
        tag: impl Into<String>,
        index: usize,
        salt: Vec<u8>,
        context: ConnectionContext,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, frames) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let handle = context.handle.clone();

        let inner = Arc::new(ConnectionInner {
            tag: tag.into(),
            index,
            salt,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            draining: AtomicBool::new(false),
            next_sync: AtomicU64::new(0),
            next_stream: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            writer,
            negotiated: RwLock::new(Negotiated::default()),
            watchers: Mutex::new(HashMap::new()),
            context,
            closed,
            drained: Notify::new(),
        });

        handle.spawn(write_loop(write_half, frames, Arc::downgrade(&inner), inner.closed.subscribe()));
        handle.spawn(read_loop(read_half, Arc::downgrade(&inner), inner.closed.subscribe()));
        debug!(tag = %inner.tag, index, "connection started");
        Connection { inner }
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Moves to `state` unless already closed.
    pub fn set_state(&self, state: ConnectionState) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(state as u8)
            });
    }

    /// Ready and not draining: eligible for selection.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready && !self.inner.draining.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn negotiated(&self) -> Negotiated {
        *self.inner.negotiated.read()
    }

    pub(crate) fn set_negotiated(&self, negotiated: Negotiated) {
        *self.inner.negotiated.write() = negotiated;
    }

    /// Salt from the server greeting.
    pub fn salt(&self) -> &[u8] {
        &self.inner.salt
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues a request and returns a future for its response.
    ///
    /// **Input**: request type, body, and options (timeout, format, schema
    /// version, stream).
    /// **Output**: a `ResponseFuture`; the method itself never blocks.
    ///
    /// **Logic**:
    /// 1. Allocate the next sync id and register the waiter.
    /// 2. Start the deadline timer for that sync id.
    /// 3. Queue the encoded frame for the writer task.
    pub fn send_request(
        &self,
        kind: RequestType,
        body: Body,
        opts: RequestOptions,
    ) -> ClientResult<ResponseFuture> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let sync = self.inner.next_sync.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = opts.timeout.unwrap_or(self.inner.context.request_timeout);

        let mut header = Header::request(kind, SyncId(sync));
        header.schema_version = opts.schema_version;
        header.stream_id = opts.stream_id;
        let frame = encode_frame(header, body)?;

        let (waiter, rx) = ResponseWaiter::new(opts.format);
        self.inner.pending.lock().insert(sync, waiter);
        if let Some(metrics) = &self.inner.context.metrics {
            metrics.record_request_start();
        }

        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.context.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(sync, timeout);
            }
        });
        if let Some(waiter) = self.inner.pending.lock().get_mut(&sync) {
            waiter.set_timer(timer.abort_handle());
        }

        trace!(tag = %self.inner.tag, index = self.inner.index, sync, ?kind, "request queued");
        if self.inner.writer.send(frame).is_err() {
            if let Some(waiter) = self.inner.take_waiter(sync) {
                self.inner.finish(waiter, Err(ClientError::ConnectionClosed));
            }
        }
        Ok(ResponseFuture::new(SyncId(sync), rx))
    }

    /// Queues a request the server never answers.
    pub fn send_oneway(&self, kind: RequestType, body: Body) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let sync = self.inner.next_sync.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = encode_frame(Header::request(kind, SyncId(sync)), body)?;
        self.inner
            .writer
            .send(frame)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    fn guard(&self, capability: Capability) -> ClientResult<()> {
        self.negotiated()
            .check(capability)
            .map_err(|message| ClientError::Contract(message.to_string()))
    }

    fn guard_targets(&self, space: &RequestTarget, index: Option<&RequestTarget>) -> ClientResult<()> {
        self.negotiated()
            .check_targets(space, index)
            .map_err(|message| ClientError::Contract(message.to_string()))
    }

    pub fn ping(&self, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.send_request(RequestType::Ping, ping_body(), opts)
    }

    pub fn call(&self, function: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        if function.is_empty() {
            return Err(ClientError::Contract("function name must not be empty".into()));
        }
        self.send_request(RequestType::Call, call_body(function, args), opts)
    }

    pub fn eval(&self, expr: &str, args: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        if expr.is_empty() {
            return Err(ClientError::Contract("expression must not be empty".into()));
        }
        self.send_request(RequestType::Eval, eval_body(expr, args), opts)
    }

    pub fn select(
        &self,
        space: &RequestTarget,
        index: &RequestTarget,
        key: Vec<Value>,
        params: SelectParams,
        opts: RequestOptions,
    ) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, Some(index))?;
        self.send_request(RequestType::Select, select_body(space, index, key, params), opts)
    }

    pub fn insert(&self, space: &RequestTarget, tuple: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, None)?;
        self.send_request(RequestType::Insert, tuple_body(space, tuple), opts)
    }

    pub fn replace(&self, space: &RequestTarget, tuple: Vec<Value>, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, None)?;
        self.send_request(RequestType::Replace, tuple_body(space, tuple), opts)
    }

    pub fn update(
        &self,
        space: &RequestTarget,
        index: &RequestTarget,
        key: Vec<Value>,
        ops: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, Some(index))?;
        self.send_request(RequestType::Update, update_body(space, index, key, ops), opts)
    }

    pub fn upsert(
        &self,
        space: &RequestTarget,
        tuple: Vec<Value>,
        ops: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, None)?;
        self.send_request(RequestType::Upsert, upsert_body(space, tuple, ops), opts)
    }

    pub fn delete(
        &self,
        space: &RequestTarget,
        index: &RequestTarget,
        key: Vec<Value>,
        opts: RequestOptions,
    ) -> ClientResult<ResponseFuture> {
        self.guard_targets(space, Some(index))?;
        self.send_request(RequestType::Delete, delete_body(space, index, key), opts)
    }

    /// Authenticates the session with `chap-sha1`.
    pub fn authorize(&self, user: &str, password: &str, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        if user.is_empty() {
            return Err(ClientError::Contract("user name must not be empty".into()));
        }
        let scramble = chap_sha1_scramble(&self.inner.salt, password);
        self.send_request(RequestType::Auth, auth_body(user, &scramble), opts)
    }

    /// Subscribes `callback` to `key`; replaces an earlier callback for it.
    pub fn watch(&self, key: &str, callback: WatchCallback) -> ClientResult<()> {
        self.guard(Capability::Watch)?;
        self.inner.watchers.lock().insert(key.to_string(), callback);
        self.send_oneway(RequestType::Watch, watch_body(key))
    }

    pub fn unwatch(&self, key: &str) -> ClientResult<()> {
        self.guard(Capability::Watch)?;
        self.inner.watchers.lock().remove(key);
        self.send_oneway(RequestType::Unwatch, watch_body(key))
    }

    /// Reads the current value of `key` without subscribing.
    pub fn watch_once(&self, key: &str, opts: RequestOptions) -> ClientResult<ResponseFuture> {
        self.guard(Capability::WatchOnce)?;
        self.send_request(RequestType::WatchOnce, watch_body(key), opts)
    }

    /// Keys with a registered callback.
    pub fn watched_keys(&self) -> Vec<String> {
        self.inner.watchers.lock().keys().cloned().collect()
    }

    /// Opens a stream bound to this connection.
    pub fn new_stream(&self) -> ClientResult<Stream> {
        self.guard(Capability::Stream)?;
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Stream::new(self.clone(), StreamId(id)))
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Closes the connection.
    ///
    /// With `graceful`, the connection stops being selectable and pending
    /// requests get up to `grace` to complete; whatever is still pending
    /// afterwards fails with `ConnectionClosed`.
    pub async fn close(&self, graceful: bool, grace: Duration) {
        if self.is_closed() {
            return;
        }
        if graceful {
            self.inner.draining.store(true, Ordering::Release);
            if tokio::time::timeout(grace, self.drained()).await.is_err() {
                debug!(
                    tag = %self.inner.tag,
                    index = self.inner.index,
                    pending = self.pending_count(),
                    "grace period elapsed with requests pending"
                );
            }
        }
        self.inner.shutdown("closed by client");
    }

    async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Closes immediately, failing pending requests.
    pub fn abort(&self) {
        self.inner.shutdown("aborted");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("tag", &self.inner.tag)
            .field("index", &self.inner.index)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionInner {
    fn take_waiter(&self, sync: u64) -> Option<ResponseWaiter> {
        let mut pending = self.pending.lock();
        let waiter = pending.remove(&sync);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
        waiter
    }

    fn finish(&self, waiter: ResponseWaiter, result: ClientResult<Response>) {
        if let Some(metrics) = &self.context.metrics {
            let outcome = match &result {
                Ok(_) => RequestOutcome::Ok,
                Err(ClientError::Timeout { .. }) => RequestOutcome::Timeout,
                Err(ClientError::ConnectionClosed) => RequestOutcome::Closed,
                Err(_) => RequestOutcome::Error,
            };
            metrics.record_request_end(waiter.started.elapsed(), outcome);
        }
        waiter.complete(result);
    }

    fn expire(&self, sync: u64, timeout: Duration) {
        if let Some(waiter) = self.take_waiter(sync) {
            debug!(tag = %self.tag, index = self.index, sync, ?timeout, "request timed out");
            self.finish(waiter, Err(ClientError::Timeout { sync, timeout }));
        }
    }

    fn handle_packet(&self, raw: RawPacket) {
        let header = &raw.packet.header;
        if let Some(version) = header.schema_version {
            self.context.schema_versions.observe(version);
        }
        if header.is_event() {
            let sync = header.sync;
            if let Some(body) = self.handle_event(raw.packet.body) {
                trace!(tag = %self.tag, index = self.index, key = ?body.get_str(KEY_EVENT_KEY), "event nobody watches");
                self.forward_ignored(sync, &raw.bytes);
            }
            return;
        }
        if header.is_chunk() {
            self.forward_ignored(header.sync, &raw.bytes);
            return;
        }

        let sync = header.sync;
        let Some(waiter) = self.take_waiter(sync) else {
            self.forward_ignored(sync, &raw.bytes);
            return;
        };
        trace!(tag = %self.tag, index = self.index, sync, "response matched");
        let result = match raw.packet.server_error() {
            Some(err) => Err(ClientError::from(err)),
            None => Ok(Response {
                sync,
                schema_version: raw.packet.header.schema_version,
                format: waiter.format,
                body: raw.packet.body,
            }),
        };
        self.finish(waiter, result);
    }

    fn forward_ignored(&self, sync: u64, bytes: &Bytes) {
        if let Some(metrics) = &self.context.metrics {
            metrics.record_ignored();
        }
        match &self.context.ignored_packet {
            Some(hook) => hook(&self.tag, self.index, bytes),
            None => warn!(tag = %self.tag, index = self.index, sync, "ignoring packet with no pending request"),
        }
    }

    /// Dispatches an event to its watcher; hands the body back when no
    /// watcher claims it.
    fn handle_event(&self, body: Body) -> Option<Body> {
        let Some(key) = body.get_str(KEY_EVENT_KEY).map(str::to_string) else {
            return Some(body);
        };
        let Some(callback) = self.watchers.lock().get(&key).cloned() else {
            return Some(body);
        };
        let event = WatchEvent {
            key: key.clone(),
            data: body.get(KEY_EVENT_DATA).cloned(),
            tag: self.tag.clone(),
            index: self.index,
        };
        self.context.dispatcher.dispatch(callback, event);

        // Acknowledge so the server sends the next change.
        if let Ok(frame) = encode_frame(
            Header::request(RequestType::Watch, SyncId(self.next_sync.fetch_add(1, Ordering::Relaxed) + 1)),
            watch_body(&key),
        ) {
            let _ = self.writer.send(frame);
        }
        None
    }

    fn shutdown(&self, reason: &str) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }
        let waiters: Vec<ResponseWaiter> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, waiter)| waiter).collect()
        };
        debug!(
            tag = %self.tag,
            index = self.index,
            failed = waiters.len(),
            reason,
            "connection closed"
        );
        for waiter in waiters {
            self.finish(waiter, Err(ClientError::ConnectionClosed));
        }
        self.drained.notify_waiters();
        self.closed.send_replace(true);
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    inner: Weak<ConnectionInner>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = writer.write_all(&frame).await {
                    if let Some(inner) = inner.upgrade() {
                        debug!(tag = %inner.tag, index = inner.index, error = %err, "write failed");
                        inner.shutdown("write failed");
                    }
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, inner: Weak<ConnectionInner>, mut closed: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let max_frame = match inner.upgrade() {
        Some(inner) => inner.context.max_frame,
        None => return,
    };
    let mut decoder = PacketDecoder::with_max_frame(max_frame);
    let mut buffer = BytesMut::with_capacity(16 * 1024);

    let reason = loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => break "peer closed",
                    Ok(_) => {}
                    Err(_) => break "read failed",
                }
            }
            _ = closed.changed() => return,
        }

        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(raw)) => match inner.upgrade() {
                    Some(inner) => inner.handle_packet(raw),
                    None => return,
                },
                Ok(None) => break,
                Err(err) => {
                    if let Some(inner) = inner.upgrade() {
                        warn!(tag = %inner.tag, index = inner.index, error = %err, "undecodable frame");
                        inner.shutdown("protocol error");
                    }
                    return;
                }
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.shutdown(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn context() -> ConnectionContext {
        ConnectionContext::new(Handle::current())
    }

    async fn read_packet(server: &mut DuplexStream, buf: &mut BytesMut) -> RawPacket {
        let mut decoder = PacketDecoder::new();
        loop {
            if let Some(raw) = decoder.decode(buf).unwrap() {
                return raw;
            }
            server.read_buf(buf).await.unwrap();
        }
    }

    async fn reply(server: &mut DuplexStream, sync: u64, body: Body) {
        let frame = encode_frame(Header::response(STATUS_OK, sync, 1), body).unwrap();
        server.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn responses_match_by_sync_out_of_order() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());

        let first = conn.call("a", vec![], RequestOptions::new()).unwrap();
        let second = conn.call("b", vec![], RequestOptions::new()).unwrap();

        let mut buf = BytesMut::new();
        let req_a = read_packet(&mut server, &mut buf).await;
        let req_b = read_packet(&mut server, &mut buf).await;
        assert_eq!(req_a.packet.body.get_str(KEY_FUNCTION_NAME), Some("a"));
        assert_eq!(req_b.packet.body.get_str(KEY_FUNCTION_NAME), Some("b"));

        reply(&mut server, req_b.packet.header.sync, Body::new().with(KEY_DATA, Value::Array(vec![Value::from("B")]))).await;
        reply(&mut server, req_a.packet.header.sync, Body::new().with(KEY_DATA, Value::Array(vec![Value::from("A")]))).await;

        assert_eq!(first.await.unwrap().into_data(), vec![Value::from("A")]);
        assert_eq!(second.await.unwrap().into_data(), vec![Value::from("B")]);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn server_error_becomes_client_error() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        let future = conn.eval("return x", vec![], RequestOptions::new()).unwrap();

        let mut buf = BytesMut::new();
        let request = read_packet(&mut server, &mut buf).await;
        let frame = encode_frame(
            Header::response(STATUS_ERROR_BIT | 32, request.packet.header.sync, 1),
            Body::new().with(KEY_ERROR_24, "boom"),
        )
        .unwrap();
        server.write_all(&frame).await.unwrap();

        match future.await {
            Err(ClientError::Server { code, message }) => {
                assert_eq!(code, 32);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_close_fails_pending() {
        let (client, server) = duplex(1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        let future = conn.ping(RequestOptions::new()).unwrap();
        drop(server);
        assert!(matches!(future.await, Err(ClientError::ConnectionClosed)));
        conn.closed().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.ping(RequestOptions::new()), Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn name_target_rejected_before_send() {
        let (client, mut server) = duplex(1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        conn.set_negotiated(Negotiated::new(3, FeatureSet::empty()));

        let err = conn
            .select(&"users".into(), &RequestTarget::default(), vec![], SelectParams::default(), RequestOptions::new())
            .unwrap_err();
        assert_eq!(err.to_string(), SPACE_NAME_UNSUPPORTED);
        assert_eq!(conn.pending_count(), 0);

        conn.abort();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no frame may reach the socket");
    }

    #[tokio::test]
    async fn unwatched_events_reach_ignored_hook() {
        let (client, mut server) = duplex(64 * 1024);
        let seen: Arc<Mutex<Vec<(String, usize, Bytes)>>> = Arc::default();
        let hook_seen = seen.clone();
        let mut context = context();
        context.ignored_packet = Some(Arc::new(move |tag: &str, index: usize, bytes: &Bytes| {
            hook_seen.lock().push((tag.to_string(), index, bytes.clone()))
        }));
        let conn = Connection::spawn(client, "replica", 3, vec![0; 20], context);

        let unwatched = encode_frame(
            Header::response(RequestType::Event.code(), 0, 1),
            Body::new().with(KEY_EVENT_KEY, "nobody").with(KEY_EVENT_DATA, 1),
        )
        .unwrap();
        let keyless = encode_frame(Header::response(RequestType::Event.code(), 0, 1), Body::new()).unwrap();
        server.write_all(&unwatched).await.unwrap();
        server.write_all(&keyless).await.unwrap();

        // A ping round trip orders the check after both events were read.
        let pong = conn.ping(RequestOptions::new()).unwrap();
        let mut buf = BytesMut::new();
        let request = read_packet(&mut server, &mut buf).await;
        reply(&mut server, request.packet.header.sync, Body::new()).await;
        pong.await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].0.as_str(), seen[0].1), ("replica", 3));
        // The hook gets the frame payload, without the length prefix.
        assert!(!seen[0].2.is_empty() && unwatched.ends_with(&seen[0].2));
        assert!(!seen[1].2.is_empty() && keyless.ends_with(&seen[1].2));
    }

    #[tokio::test]
    async fn closed_resolves_after_close_finished() {
        let (client, _server) = duplex(1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        conn.abort();
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("closed() must resolve once the connection is closed");
    }

    #[tokio::test]
    async fn graceful_close_waits_for_pending() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        let future = conn.ping(RequestOptions::new()).unwrap();

        let mut buf = BytesMut::new();
        let request = read_packet(&mut server, &mut buf).await;
        let closer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close(true, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!conn.is_ready());
        assert!(!conn.is_closed());

        reply(&mut server, request.packet.header.sync, Body::new()).await;
        assert!(future.await.is_ok());
        closer.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn set_state_cannot_reopen() {
        let (client, _server) = duplex(1024);
        let conn = Connection::spawn(client, "default", 0, vec![0; 20], context());
        conn.set_state(ConnectionState::Ready);
        assert!(conn.is_ready());
        conn.abort();
        conn.set_state(ConnectionState::Ready);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
