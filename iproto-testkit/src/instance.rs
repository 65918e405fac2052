//! # Mock Instance
//!
//! Purpose: A scripted server speaking the binary protocol on
//! `127.0.0.1:0`, so client tests exercise real sockets without a database.
//!
//! ## Design Principles
//! 1. **Connection Per Task**: Each accepted socket runs in its own task
//!    with a reader loop and a writer task, the same shape as the client.
//! 2. **Scripted Replies**: `CALL` and `EVAL` are answered by registered
//!    closures that may delay, fail, or stay silent.
//! 3. **Observable**: Request counters, connection counts, and stored rows
//!    are readable from the test while the instance runs.
//! 4. **Disruptable**: Tests can mute the instance, drop every connection,
//!    or bump the schema version at any point.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use iproto_common::{Feature, FeatureSet, Greeting, PacketDecoder, RequestType, CLIENT_PROTOCOL_VERSION};
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch;
use crate::space::MockSpace;

/// Scripted answer to a `CALL` or `EVAL`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Data(Vec<Value>),
    Error { code: u32, message: String },
    Delayed(Duration, Box<Reply>),
    /// Never answer.
    Silent,
}

impl Reply {
    pub fn value(value: impl Into<Value>) -> Self {
        Reply::Data(vec![value.into()])
    }

    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        Reply::Delayed(delay, Box::new(self))
    }
}

/// Handler for a function or expression; receives the call arguments.
pub type Handler = Arc<dyn Fn(&[Value]) -> Reply + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) version: u64,
    pub(crate) features: FeatureSet,
    pub(crate) id_supported: bool,
    pub(crate) users: HashMap<String, String>,
}

pub(crate) struct InstanceState {
    pub(crate) settings: Settings,
    pub(crate) schema_version: AtomicU64,
    pub(crate) spaces: Mutex<BTreeMap<u32, MockSpace>>,
    pub(crate) calls: Mutex<HashMap<String, Handler>>,
    pub(crate) evals: Mutex<HashMap<String, Handler>>,
    pub(crate) muted: AtomicBool,
    pub(crate) counters: Mutex<HashMap<u32, usize>>,
    pub(crate) values: Mutex<HashMap<String, (Value, u64)>>,
    pub(crate) streams: Mutex<HashSet<u64>>,
    event_version: AtomicU64,
    events: watch::Sender<u64>,
    kill: broadcast::Sender<()>,
    accepted: AtomicUsize,
    active: AtomicUsize,
}

impl InstanceState {
    pub(crate) fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Acquire)
    }

    pub(crate) fn count(&self, code: u32) {
        *self.counters.lock().entry(code).or_default() += 1;
    }
}

/// Builder for a mock instance.
pub struct InstanceBuilder {
    settings: Settings,
    schema_version: u64,
    spaces: Vec<MockSpace>,
    calls: HashMap<String, Handler>,
    evals: HashMap<String, Handler>,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        InstanceBuilder {
            settings: Settings {
                version: CLIENT_PROTOCOL_VERSION,
                features: FeatureSet::all(),
                id_supported: true,
                users: HashMap::new(),
            },
            schema_version: 1,
            spaces: Vec::new(),
            calls: HashMap::new(),
            evals: HashMap::new(),
        }
    }
}

impl InstanceBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.settings.version = version;
        self
    }

    pub fn features(mut self, features: FeatureSet) -> Self {
        self.settings.features = features;
        self
    }

    pub fn without_feature(mut self, feature: Feature) -> Self {
        self.settings.features.remove(feature);
        self
    }

    /// Answers `ID` with "unknown request type", like servers that predate it.
    pub fn legacy(mut self) -> Self {
        self.settings.id_supported = false;
        self
    }

    pub fn user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.settings.users.insert(name.into(), password.into());
        self
    }

    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    pub fn space(mut self, space: MockSpace) -> Self {
        self.spaces.push(space);
        self
    }

    pub fn on_call<F>(mut self, function: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Reply + Send + Sync + 'static,
    {
        self.calls.insert(function.into(), Arc::new(handler));
        self
    }

    pub fn on_eval<F>(mut self, expr: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Reply + Send + Sync + 'static,
    {
        self.evals.insert(expr.into(), Arc::new(handler));
        self
    }

    /// Binds `127.0.0.1:0` and starts accepting.
    pub async fn start(self) -> anyhow::Result<MockInstance> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind mock instance")?;
        let addr = listener.local_addr().context("mock instance address")?;
        let (events, _) = watch::channel(0);
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(InstanceState {
            settings: self.settings,
            schema_version: AtomicU64::new(self.schema_version),
            spaces: Mutex::new(self.spaces.into_iter().map(|space| (space.id, space)).collect()),
            calls: Mutex::new(self.calls),
            evals: Mutex::new(self.evals),
            muted: AtomicBool::new(false),
            counters: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashSet::new()),
            event_version: AtomicU64::new(0),
            events,
            kill,
            accepted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        });
        let accept = tokio::spawn(accept_loop(listener, state.clone()));
        debug!(%addr, "mock instance listening");
        Ok(MockInstance { addr, state, accept })
    }
}

/// A running mock instance; stops accepting and drops connections on drop.
pub struct MockInstance {
    addr: SocketAddr,
    state: Arc<InstanceState>,
    accept: JoinHandle<()>,
}

impl MockInstance {
    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::default()
    }

    /// Instance with default settings and no spaces.
    pub async fn start() -> anyhow::Result<MockInstance> {
        InstanceBuilder::default().start().await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn schema_version(&self) -> u64 {
        self.state.schema_version()
    }

    /// Increments the schema version and returns the new one.
    pub fn bump_schema(&self) -> u64 {
        self.state.schema_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Adds or replaces a space; bumps the schema version.
    pub fn create_space(&self, space: MockSpace) -> u64 {
        self.state.spaces.lock().insert(space.id, space);
        self.bump_schema()
    }

    pub fn drop_space(&self, id: u32) -> u64 {
        self.state.spaces.lock().remove(&id);
        self.bump_schema()
    }

    /// Current rows of a space.
    pub fn rows(&self, id: u32) -> Vec<Vec<Value>> {
        self.state
            .spaces
            .lock()
            .get(&id)
            .map(|space| space.rows().to_vec())
            .unwrap_or_default()
    }

    pub fn on_call<F>(&self, function: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) -> Reply + Send + Sync + 'static,
    {
        self.state.calls.lock().insert(function.into(), Arc::new(handler));
    }

    /// While muted, requests are read and counted but never answered.
    pub fn set_muted(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Release);
    }

    /// Closes every open connection; the listener keeps accepting.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Sets a watched key and notifies watchers.
    pub fn broadcast(&self, key: impl Into<String>, value: impl Into<Value>) {
        let version = self.state.event_version.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.values.lock().insert(key.into(), (value.into(), version));
        self.state.events.send_replace(version);
    }

    /// Number of requests of `kind` received so far.
    pub fn request_count(&self, kind: RequestType) -> usize {
        self.state.counters.lock().get(&kind.code()).copied().unwrap_or(0)
    }

    pub fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::Acquire)
    }

    /// Distinct stream ids seen on requests.
    pub fn streams_seen(&self) -> usize {
        self.state.streams.lock().len()
    }
}

impl Drop for MockInstance {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.state.kill.send(());
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<InstanceState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "mock accept failed");
                continue;
            }
        };
        let seq = state.accepted.fetch_add(1, Ordering::AcqRel) as u8;
        let state = state.clone();
        tokio::spawn(async move {
            state.active.fetch_add(1, Ordering::AcqRel);
            if let Err(err) = serve(stream, state.clone(), seq).await {
                debug!(%peer, error = %err, "mock connection ended");
            }
            state.active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Per-connection session data.
pub(crate) struct Session {
    pub(crate) salt: Vec<u8>,
    pub(crate) user: String,
    /// Watched keys with the last event version sent.
    pub(crate) watched: HashMap<String, u64>,
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
}

async fn serve(stream: TcpStream, state: Arc<InstanceState>, seq: u8) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let salt: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(31).wrapping_add(seq)).collect();
    let greeting = Greeting {
        server: "Tarantool 3.1.0 (Binary) mock".to_string(),
        salt: salt.clone(),
    };
    writer.write_all(&greeting.encode()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        salt,
        user: "guest".to_string(),
        watched: HashMap::new(),
        tx,
    };
    let mut kill = state.kill.subscribe();
    let mut events = state.events.subscribe();
    let mut decoder = PacketDecoder::new();
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    let result = loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => {}
                    Err(err) => break Err(err.into()),
                }
                loop {
                    match decoder.decode(&mut buffer) {
                        Ok(Some(raw)) => dispatch::handle(&state, &mut session, raw.packet),
                        Ok(None) => break,
                        Err(err) => {
                            writer_task.abort();
                            return Err(err.into());
                        }
                    }
                }
            }
            _ = kill.recv() => break Ok(()),
            changed = events.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                dispatch::push_events(&state, &mut session);
            }
        }
    };
    writer_task.abort();
    result
}
