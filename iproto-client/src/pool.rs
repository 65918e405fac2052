//! # Connection Pool
//!
//! Purpose: Keep `size` connections per instance group alive, track which of
//! them may be selected, and tear everything down exactly once.
//!
//! ## Design Principles
//! 1. **Slots, Not Sockets**: The pool owns one slot per configured
//!    connection; a slot's socket comes and goes, the slot stays.
//! 2. **Supervisor Per Slot**: Each slot has a task that connects, waits for
//!    the connection to close, and reconnects after a delay, so one failing
//!    slot never affects its siblings.
//! 3. **Quarantine Survives Reconnect**: A slot the heartbeat has degraded or
//!    evicted brings new connections up as `Degraded` until a probe
//!    succeeds.
//! 4. **Exactly-Once Close**: The first `close()` wins an atomic flag and
//!    performs teardown; concurrent callers wait for it to finish.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ClientError, ClientResult};
use crate::factory::ConnectionFactory;
use crate::group::InstanceConnectionGroup;
use crate::watch::WatchCallback;

/// Lifecycle notifications emitted by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected { tag: String, index: usize },
    Disconnected { tag: String, index: usize },
    ConnectFailed { tag: String, index: usize, error: String },
    Reconnecting { tag: String, index: usize, delay: Duration },
    /// Heartbeat marked the connection Degraded.
    Invalidated { tag: String, index: usize },
    /// A Degraded connection passed its probes again.
    Recovered { tag: String, index: usize },
    /// Heartbeat closed the connection after repeated bad windows.
    Evicted { tag: String, index: usize },
    /// An evicted slot passed a probe and is selectable again.
    Reinstated { tag: String, index: usize },
    Closed,
}

/// Receives every pool event synchronously.
pub trait PoolEventListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent);
}

/// Pool settings derived from the client configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub reconnect_delay: Duration,
    pub graceful_shutdown: bool,
    pub grace: Duration,
    pub reregister_watches: bool,
}

impl PoolConfig {
    pub fn from_client(config: &ClientConfig) -> Self {
        PoolConfig {
            reconnect_delay: config.reconnect_delay(),
            graceful_shutdown: config.graceful_shutdown,
            grace: config.graceful_grace(),
            reregister_watches: config.watchers.reregister_on_reconnect,
        }
    }
}

struct Slot {
    group: InstanceConnectionGroup,
    index: usize,
    conn: RwLock<Option<Connection>>,
    /// New connections start Degraded while set.
    quarantined: AtomicBool,
    evicted: AtomicBool,
}

impl Slot {
    fn tag(&self) -> &str {
        &self.group.tag
    }

    fn current(&self) -> Option<Connection> {
        self.conn.read().clone()
    }
}

struct PoolInner {
    slots: Vec<Arc<Slot>>,
    factory: ConnectionFactory,
    config: PoolConfig,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    teardown_done: watch::Sender<bool>,
    ready: Notify,
    events: broadcast::Sender<PoolEvent>,
    listener: Option<Arc<dyn PoolEventListener>>,
    watches: Mutex<HashMap<String, WatchCallback>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

/// Connection pool handle; cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Establishes every configured connection and starts slot supervisors.
    ///
    /// **Output**: the pool if at least one connection came up; otherwise the
    /// first connection error.
    pub async fn start(
        groups: &[InstanceConnectionGroup],
        factory: ConnectionFactory,
        config: PoolConfig,
        listener: Option<Arc<dyn PoolEventListener>>,
    ) -> ClientResult<Self> {
        let slots: Vec<Arc<Slot>> = groups
            .iter()
            .flat_map(|group| {
                (0..group.size).map(move |index| {
                    Arc::new(Slot {
                        group: group.clone(),
                        index,
                        conn: RwLock::new(None),
                        quarantined: AtomicBool::new(false),
                        evicted: AtomicBool::new(false),
                    })
                })
            })
            .collect();

        let handle = factory.context().handle.clone();
        let attempts = slots.iter().map(|slot| {
            let factory = factory.clone();
            let slot = slot.clone();
            handle.spawn(async move { factory.connect(&slot.group, slot.index).await })
        });
        let results: Vec<ClientResult<Connection>> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or(Err(ClientError::ConnectionClosed)))
            .collect();

        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        let (teardown_done, _) = watch::channel(false);
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                slots,
                factory,
                config,
                closed: AtomicBool::new(false),
                shutdown,
                teardown_done,
                ready: Notify::new(),
                events,
                listener,
                watches: Mutex::new(HashMap::new()),
                supervisors: Mutex::new(Vec::new()),
            }),
        };

        let mut first_error = None;
        let mut connected = 0;
        let mut supervisors = Vec::with_capacity(results.len());
        for (slot, result) in pool.inner.slots.iter().zip(results) {
            let initial = match result {
                Ok(conn) => {
                    connected += 1;
                    pool.inner.install(slot, &conn);
                    Some(conn)
                }
                Err(err) => {
                    warn!(tag = %slot.tag(), index = slot.index, error = %err, "initial connect failed");
                    pool.emit(PoolEvent::ConnectFailed {
                        tag: slot.tag().to_string(),
                        index: slot.index,
                        error: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                    None
                }
            };
            supervisors.push((slot.clone(), initial));
        }

        if connected == 0 {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        let weak = Arc::downgrade(&pool.inner);
        let mut handles = pool.inner.supervisors.lock();
        for (slot, initial) in supervisors {
            handles.push(handle.spawn(supervise(weak.clone(), slot, initial)));
        }
        drop(handles);
        info!(connected, slots = pool.inner.slots.len(), "connection pool started");
        Ok(pool)
    }

    fn check_open(&self) -> ClientResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::PoolClosed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of Ready connections across all tags.
    pub fn available_connections(&self) -> ClientResult<usize> {
        self.check_open()?;
        Ok(self
            .inner
            .slots
            .iter()
            .filter(|slot| slot.current().is_some_and(|conn| conn.is_ready()))
            .count())
    }

    /// Total configured connections.
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Group tags in configuration order.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for slot in &self.inner.slots {
            if tags.last().map(String::as_str) != Some(slot.tag()) {
                tags.push(slot.tag().to_string());
            }
        }
        tags
    }

    /// Resolves one connection by tag and index within its group.
    pub fn get(&self, tag: &str, index: usize) -> ClientResult<Connection> {
        self.check_open()?;
        let slot = self
            .inner
            .slots
            .iter()
            .find(|slot| slot.tag() == tag && slot.index == index)
            .ok_or_else(|| ClientError::Contract(format!("no connection {}[{}] in pool", tag, index)))?;
        slot.current().ok_or(ClientError::ConnectionClosed)
    }

    /// Live connections, in slot order; `tag` narrows to one group.
    pub fn connections(&self, tag: Option<&str>) -> ClientResult<Vec<Connection>> {
        self.check_open()?;
        Ok(self
            .inner
            .slots
            .iter()
            .filter(|slot| tag.map_or(true, |tag| slot.tag() == tag))
            .filter_map(|slot| slot.current())
            .collect())
    }

    /// Runs `action` on every live connection; stops at the first error.
    pub fn for_each<F>(&self, mut action: F) -> ClientResult<()>
    where
        F: FnMut(&Connection) -> ClientResult<()>,
    {
        for conn in self.connections(None)? {
            if !conn.is_closed() {
                action(&conn)?;
            }
        }
        Ok(())
    }

    /// Subscribes to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn ready_notify(&self) -> &Notify {
        &self.inner.ready
    }

    /// Registers a watch on every connection and on future reconnects.
    pub fn watch(&self, key: &str, callback: WatchCallback) -> ClientResult<()> {
        self.check_open()?;
        self.inner.watches.lock().insert(key.to_string(), callback.clone());
        let mut subscribed = Vec::new();
        let result = self.for_each(|conn| {
            conn.watch(key, callback.clone())?;
            subscribed.push(conn.clone());
            Ok(())
        });
        if let Err(err) = result {
            self.inner.watches.lock().remove(key);
            for conn in subscribed {
                let _ = conn.unwatch(key);
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn unwatch(&self, key: &str) -> ClientResult<()> {
        self.check_open()?;
        self.inner.watches.lock().remove(key);
        self.for_each(|conn| conn.unwatch(key))
    }

    fn emit(&self, event: PoolEvent) {
        self.inner.emit(event);
    }

    /// Slot positions and their current connections, for probing.
    pub(crate) fn probe_targets(&self) -> Vec<(usize, Connection)> {
        self.inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| slot.current().map(|conn| (pos, conn)))
            .filter(|(_, conn)| !conn.is_closed())
            .collect()
    }

    /// Marks a slot's connection Degraded.
    pub(crate) fn invalidate(&self, pos: usize) {
        let Some(slot) = self.inner.slots.get(pos) else { return };
        if slot.quarantined.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = slot.current() {
            conn.set_state(ConnectionState::Degraded);
        }
        warn!(tag = %slot.tag(), index = slot.index, "connection invalidated by heartbeat");
        self.emit(PoolEvent::Invalidated {
            tag: slot.tag().to_string(),
            index: slot.index,
        });
    }

    /// Returns a Degraded slot to Ready after good probes.
    pub(crate) fn recover(&self, pos: usize) {
        let Some(slot) = self.inner.slots.get(pos) else { return };
        if slot.evicted.load(Ordering::Acquire) || !slot.quarantined.swap(false, Ordering::AcqRel) {
            return;
        }
        self.mark_ready(slot);
        info!(tag = %slot.tag(), index = slot.index, "connection recovered");
        self.emit(PoolEvent::Recovered {
            tag: slot.tag().to_string(),
            index: slot.index,
        });
    }

    /// Closes a slot's connection; the slot reconnects but stays unselectable
    /// until reinstated.
    pub(crate) fn evict(&self, pos: usize) {
        let Some(slot) = self.inner.slots.get(pos) else { return };
        slot.quarantined.store(true, Ordering::Release);
        if slot.evicted.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(conn) = slot.current() {
            conn.abort();
        }
        warn!(tag = %slot.tag(), index = slot.index, "connection evicted by heartbeat");
        self.emit(PoolEvent::Evicted {
            tag: slot.tag().to_string(),
            index: slot.index,
        });
    }

    /// Makes an evicted slot selectable again.
    pub(crate) fn reinstate(&self, pos: usize) {
        let Some(slot) = self.inner.slots.get(pos) else { return };
        if !slot.evicted.swap(false, Ordering::AcqRel) {
            return;
        }
        slot.quarantined.store(false, Ordering::Release);
        self.mark_ready(slot);
        info!(tag = %slot.tag(), index = slot.index, "connection reinstated");
        self.emit(PoolEvent::Reinstated {
            tag: slot.tag().to_string(),
            index: slot.index,
        });
    }

    fn mark_ready(&self, slot: &Slot) {
        if let Some(conn) = slot.current() {
            conn.set_state(ConnectionState::Ready);
            self.inner.ready.notify_waiters();
        }
    }

    /// Closes the pool once; concurrent callers wait for the same teardown.
    ///
    /// **Logic**:
    /// 1. Win the `closed` flag, or wait for the winner to finish.
    /// 2. Stop supervisors from reconnecting.
    /// 3. Close every connection (gracefully if configured).
    /// 4. Emit `Closed` and release waiters.
    pub async fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut done = self.inner.teardown_done.subscribe();
            shutdown_signal(&mut done).await;
            return;
        }

        debug!("closing connection pool");
        self.inner.shutdown.send_replace(true);
        self.inner.ready.notify_waiters();

        let config = &self.inner.config;
        let connections: Vec<Connection> = self.inner.slots.iter().filter_map(|slot| slot.current()).collect();
        join_all(
            connections
                .iter()
                .map(|conn| conn.close(config.graceful_shutdown, config.grace)),
        )
        .await;

        for supervisor in self.inner.supervisors.lock().drain(..) {
            supervisor.abort();
        }
        for slot in &self.inner.slots {
            if let Some(conn) = slot.conn.write().take() {
                conn.abort();
            }
        }

        self.emit(PoolEvent::Closed);
        info!("connection pool closed");
        self.inner.teardown_done.send_replace(true);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("slots", &self.inner.slots.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolInner {
    fn emit(&self, event: PoolEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Puts a fresh connection into its slot and announces it.
    fn install(&self, slot: &Slot, conn: &Connection) {
        if slot.quarantined.load(Ordering::Acquire) {
            conn.set_state(ConnectionState::Degraded);
        }
        if self.config.reregister_watches {
            let watches: Vec<(String, WatchCallback)> = self
                .watches
                .lock()
                .iter()
                .map(|(key, callback)| (key.clone(), callback.clone()))
                .collect();
            for (key, callback) in watches {
                if let Err(err) = conn.watch(&key, callback) {
                    warn!(tag = %slot.tag(), index = slot.index, key = %key, error = %err, "watch re-registration failed");
                }
            }
        }
        *slot.conn.write() = Some(conn.clone());
        self.emit(PoolEvent::Connected {
            tag: slot.tag().to_string(),
            index: slot.index,
        });
        self.ready.notify_waiters();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for supervisor in self.supervisors.get_mut().drain(..) {
            supervisor.abort();
        }
        for slot in &self.slots {
            if let Some(conn) = slot.conn.write().take() {
                conn.abort();
            }
        }
    }
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// Keeps one slot connected until the pool closes; `initial` is already
/// installed in the slot.
async fn supervise(pool: Weak<PoolInner>, slot: Arc<Slot>, initial: Option<Connection>) {
    let mut next = initial;
    let mut shutdown = match pool.upgrade() {
        Some(inner) => inner.shutdown.subscribe(),
        None => return,
    };

    loop {
        let conn = match next.take() {
            Some(conn) => Some(conn),
            None => reconnect(&pool, &slot).await,
        };

        if let Some(conn) = conn {
            tokio::select! {
                _ = conn.closed() => {}
                _ = shutdown_signal(&mut shutdown) => return,
            }

            {
                let mut current = slot.conn.write();
                if current.as_ref().is_some_and(|c| c.same_as(&conn)) {
                    *current = None;
                }
            }
            let Some(inner) = pool.upgrade() else { return };
            if inner.is_closed() {
                return;
            }
            debug!(tag = %slot.tag(), index = slot.index, "connection lost");
            inner.emit(PoolEvent::Disconnected {
                tag: slot.tag().to_string(),
                index: slot.index,
            });
        }

        let Some(inner) = pool.upgrade() else { return };
        if inner.is_closed() {
            return;
        }
        let delay = inner.config.reconnect_delay;
        inner.emit(PoolEvent::Reconnecting {
            tag: slot.tag().to_string(),
            index: slot.index,
            delay,
        });
        drop(inner);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_signal(&mut shutdown) => return,
        }
    }
}

/// One connect attempt for a slot; installs the connection on success.
async fn reconnect(pool: &Weak<PoolInner>, slot: &Arc<Slot>) -> Option<Connection> {
    let inner = pool.upgrade()?;
    if inner.is_closed() {
        return None;
    }
    let factory = inner.factory.clone();
    drop(inner);

    let result = factory.connect(&slot.group, slot.index).await;
    let inner = pool.upgrade()?;
    match result {
        Ok(conn) => {
            if inner.is_closed() {
                conn.abort();
                return None;
            }
            inner.install(slot, &conn);
            Some(conn)
        }
        Err(err) => {
            warn!(tag = %slot.tag(), index = slot.index, error = %err, "reconnect failed");
            inner.emit(PoolEvent::ConnectFailed {
                tag: slot.tag().to_string(),
                index: slot.index,
                error: err.to_string(),
            });
            None
        }
    }
}
