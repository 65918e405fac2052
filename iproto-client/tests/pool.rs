mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use iproto_client::{Client, ClientError, PoolEvent, RequestOptions, WatchEvent};
use iproto_testkit::{init_tracing, MockInstance, Reply};
use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::mpsc;

use common::{config, connect, hooks, listener, wait_for_event};

async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("watch event in time")
        .expect("watch channel open")
}

#[tokio::test]
async fn late_reply_goes_to_ignored_hook_once() {
    init_tracing();
    let instance = MockInstance::builder()
        .on_call("slow", |_| Reply::value("late").after(Duration::from_millis(300)))
        .start()
        .await
        .unwrap();
    let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::default();
    let hook_seen = seen.clone();
    let hooks = hooks().on_ignored_packet(move |tag, index, _| hook_seen.lock().push((tag.to_string(), index)));
    let client = Client::connect_with_hooks(config(&instance, 1), hooks).await.unwrap();

    let opts = RequestOptions::new().with_timeout(Duration::from_millis(50));
    let err = client.call("slow", vec![], opts).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout { .. }), "{err:?}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*seen.lock(), vec![("default".to_string(), 0)]);

    // The connection is still usable after the stray reply.
    client.ping(RequestOptions::new()).await.unwrap();
    assert_eq!(seen.lock().len(), 1);
    client.close().await;
}

#[tokio::test]
async fn concurrent_close_tears_down_once() {
    let instance = MockInstance::start().await.unwrap();
    let recorder = listener();
    let client = Client::connect_with_hooks(config(&instance, 2), hooks().with_listener(recorder.clone()))
        .await
        .unwrap();
    assert_eq!(recorder.count(|e| matches!(e, PoolEvent::Connected { .. })), 2);

    join_all((0..8).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.close().await })
    }))
    .await;

    assert_eq!(recorder.count(|e| *e == PoolEvent::Closed), 1);
    assert!(client.is_closed());
    assert!(matches!(client.available_connections(), Err(ClientError::PoolClosed)));
    assert!(matches!(
        client.eval("return 1", vec![], RequestOptions::new()).await,
        Err(ClientError::PoolClosed)
    ));
    assert!(matches!(client.pool().get("default", 0), Err(ClientError::PoolClosed)));

    // Closing again is a no-op.
    tokio::time::timeout(Duration::from_secs(2), client.close())
        .await
        .expect("repeated close returns");
    assert_eq!(recorder.count(|e| *e == PoolEvent::Closed), 1);
}

#[tokio::test]
async fn close_after_close_returns_immediately() {
    let instance = MockInstance::start().await.unwrap();
    let recorder = listener();
    let client = Client::connect_with_hooks(config(&instance, 2), hooks().with_listener(recorder.clone()))
        .await
        .unwrap();

    client.close().await;
    assert!(client.is_closed());
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .expect("close after teardown must not wait");
    }
    assert_eq!(recorder.count(|e| *e == PoolEvent::Closed), 1);
}

#[tokio::test]
async fn dropped_client_releases_connections() {
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 2)).await.unwrap();
    client.ping(RequestOptions::new()).await.unwrap();
    assert_eq!(instance.active_connections(), 2);

    drop(client);
    tokio::time::timeout(Duration::from_secs(2), async {
        while instance.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections closed after the client was dropped");
}

#[tokio::test]
async fn failed_watch_leaves_nothing_registered() {
    let modern = MockInstance::start().await.unwrap();
    let legacy = MockInstance::builder().legacy().start().await.unwrap();
    let config = config(&modern, 1).with_group(common::group(&legacy, "legacy", 1));
    let client = connect(config).await.unwrap();
    let mut pool_events = client.subscribe();

    let err = client.watch("config", |_| {}).unwrap_err();
    assert!(
        matches!(err, ClientError::Contract(ref m) if m == iproto_common::WATCHERS_UNSUPPORTED),
        "{err:?}"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(modern.request_count(iproto_common::RequestType::Watch), 1);
    assert_eq!(modern.request_count(iproto_common::RequestType::Unwatch), 1);

    // The key was not kept for re-registration.
    modern.drop_connections();
    wait_for_event(&mut pool_events, Duration::from_secs(2), |e| {
        matches!(e, PoolEvent::Connected { tag, .. } if tag == "default")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(modern.request_count(iproto_common::RequestType::Watch), 1);
    client.close().await;
}

#[tokio::test]
async fn graceful_close_lets_pending_requests_finish() {
    let instance = MockInstance::builder()
        .on_call("slow", |_| Reply::value("done").after(Duration::from_millis(100)))
        .start()
        .await
        .unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("slow", vec![], RequestOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close().await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.into_data(), vec![Value::from("done")]);
}

#[tokio::test]
async fn dropped_connections_reconnect() {
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 2)).await.unwrap();
    let mut events = client.subscribe();

    instance.drop_connections();
    wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(e, PoolEvent::Disconnected { .. })).await;
    for _ in 0..2 {
        wait_for_event(&mut events, Duration::from_secs(2), |e| matches!(e, PoolEvent::Connected { .. })).await;
    }

    assert_eq!(client.available_connections().unwrap(), 2);
    assert_eq!(instance.accepted_connections(), 4);
    client.ping(RequestOptions::new()).await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn lookup_by_tag_and_index() {
    let first = MockInstance::start().await.unwrap();
    let second = MockInstance::start().await.unwrap();
    let config = config(&first, 1).with_group(common::group(&second, "replica", 2));
    let client = connect(config).await.unwrap();

    let pool = client.pool();
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.tags(), vec!["default".to_string(), "replica".to_string()]);
    assert_eq!(pool.get("replica", 1).unwrap().tag(), "replica");
    assert!(matches!(pool.get("replica", 2), Err(ClientError::Contract(_))));
    assert_eq!(pool.connections(Some("replica")).unwrap().len(), 2);

    let mut visited = 0;
    pool.for_each(|_| {
        visited += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(visited, 3);
    client.close().await;
}

#[tokio::test]
async fn watchers_fire_and_survive_reconnect() {
    let instance = MockInstance::start().await.unwrap();
    instance.broadcast("config", 1);
    let client = connect(config(&instance, 1)).await.unwrap();
    let mut pool_events = client.subscribe();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .watch("config", move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    let initial = next_event(&mut rx).await;
    assert_eq!(initial.key, "config");
    assert_eq!(initial.data, Some(Value::from(1)));

    instance.broadcast("config", 2);
    assert_eq!(next_event(&mut rx).await.data, Some(Value::from(2)));

    instance.drop_connections();
    wait_for_event(&mut pool_events, Duration::from_secs(2), |e| matches!(e, PoolEvent::Connected { .. })).await;
    // Re-registration delivers the current value again.
    assert_eq!(next_event(&mut rx).await.data, Some(Value::from(2)));
    assert!(instance.request_count(iproto_common::RequestType::Watch) >= 2);

    client.unwatch("config").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    instance.broadcast("config", 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    client.close().await;
}
