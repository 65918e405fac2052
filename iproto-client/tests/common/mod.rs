#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use iproto_client::{
    Client, ClientConfig, ClientHooks, ClientResult, InstanceConnectionGroup, PoolEvent, PoolEventListener,
};
use iproto_testkit::MockInstance;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// Group pointing at a mock instance.
pub fn group(instance: &MockInstance, tag: &str, size: usize) -> InstanceConnectionGroup {
    InstanceConnectionGroup::new(tag, instance.host(), instance.port()).with_size(size)
}

/// Short timeouts so failure paths finish quickly.
pub fn config(instance: &MockInstance, size: usize) -> ClientConfig {
    ClientConfig::new(group(instance, "default", size))
        .with_connect_timeout(Duration::from_millis(500))
        .with_request_timeout(Duration::from_millis(500))
        .with_reconnect_delay(Duration::from_millis(50))
        .with_graceful_shutdown(true, Duration::from_millis(200))
}

/// Hooks that drive I/O on the test runtime.
pub fn hooks() -> ClientHooks {
    ClientHooks::new().with_runtime(Handle::current())
}

pub async fn connect(config: ClientConfig) -> ClientResult<Client> {
    Client::connect_with_hooks(config, hooks()).await
}

/// Listener recording every event.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<PoolEvent>>,
}

impl RecordingListener {
    pub fn count(&self, matches: impl Fn(&PoolEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }
}

impl PoolEventListener for RecordingListener {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

pub fn listener() -> Arc<RecordingListener> {
    Arc::new(RecordingListener::default())
}

/// Waits for the first event accepted by `matches`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PoolEvent>,
    within: Duration,
    matches: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("pool event channel closed"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}
