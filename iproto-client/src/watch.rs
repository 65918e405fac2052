//! # Watch Dispatch
//!
//! Watch events arrive on a connection's reader task. Callbacks run on a
//! separate dispatcher task fed through a bounded queue so a slow callback
//! never stalls response matching; when the queue is full the event is
//! dropped and logged.

use std::fmt;
use std::sync::Arc;

use rmpv::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// One notification for a watched key.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: String,
    /// Current value; `None` when the key is unset.
    pub data: Option<Value>,
    /// Tag of the connection the event arrived on.
    pub tag: String,
    pub index: usize,
}

/// Callback invoked for every event of a watched key.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Sending side of the dispatcher queue; cheap to clone.
#[derive(Clone)]
pub struct WatchDispatcher {
    tx: mpsc::Sender<(WatchCallback, WatchEvent)>,
}

impl WatchDispatcher {
    /// Spawns the dispatcher task on `handle`; it exits once every sender
    /// is dropped.
    pub fn spawn(handle: &Handle, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<(WatchCallback, WatchEvent)>(capacity.max(1));
        handle.spawn(async move {
            while let Some((callback, event)) = rx.recv().await {
                trace!(key = %event.key, tag = %event.tag, "dispatching watch event");
                callback(event);
            }
        });
        WatchDispatcher { tx }
    }

    /// Queues an event; returns false if it was dropped.
    pub fn dispatch(&self, callback: WatchCallback, event: WatchEvent) -> bool {
        match self.tx.try_send((callback, event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full((_, event))) => {
                warn!(key = %event.key, tag = %event.tag, "watch queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl fmt::Debug for WatchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchDispatcher")
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(key: &str) -> WatchEvent {
        WatchEvent {
            key: key.to_string(),
            data: Some(Value::from(1)),
            tag: "default".to_string(),
            index: 0,
        }
    }

    #[tokio::test]
    async fn events_reach_callback_in_order() {
        let dispatcher = WatchDispatcher::spawn(&Handle::current(), 8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: WatchCallback = Arc::new(move |event: WatchEvent| {
            let _ = tx.send(event.key);
        });

        assert!(dispatcher.dispatch(callback.clone(), event("a")));
        assert!(dispatcher.dispatch(callback, event("b")));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_events() {
        let dispatcher = WatchDispatcher::spawn(&Handle::current(), 1);
        let callback: WatchCallback = Arc::new(|_| {});
        // The dispatcher task has not run yet on this single-threaded runtime.
        assert!(dispatcher.dispatch(callback.clone(), event("a")));
        assert!(!dispatcher.dispatch(callback, event("b")));
    }
}
