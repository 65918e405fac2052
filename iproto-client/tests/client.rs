mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use iproto_client::{
    Client, ClientConfig, ClientError, ClientHooks, ClientMetrics, RequestOptions, ResponseFormat, SelectParams,
};
use iproto_common::{Feature, FeatureSet, STREAMS_UNSUPPORTED, WATCHERS_UNSUPPORTED, WATCH_ONCE_UNSUPPORTED};
use iproto_testkit::{init_tracing, MockInstance, MockSpace};
use rmpv::Value;

use common::{config, connect, group, hooks};

fn users() -> MockSpace {
    MockSpace::new(512, "users")
        .with_index("by_name")
        .with_field("id", "unsigned")
        .with_field("name", "string")
}

#[tokio::test]
async fn round_robin_over_two_connections() {
    init_tracing();
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 2)).await.unwrap();

    assert_eq!(client.available_connections().unwrap(), 2);
    let mut picked = Vec::new();
    for _ in 0..3 {
        picked.push(client.connection().await.unwrap().index());
    }
    assert_eq!(picked, vec![0, 1, 0]);

    let replies = join_all((0..3).map(|i| client.eval("return ...", vec![Value::from(i)], RequestOptions::new()))).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap().into_data(), vec![Value::from(i as u64)]);
    }
    assert_eq!(client.available_connections().unwrap(), 2);
    assert_eq!(instance.accepted_connections(), 2);

    client.close().await;
}

#[tokio::test]
async fn single_format_unwraps_first_value() {
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();

    let opts = RequestOptions::new().with_format(ResponseFormat::Single);
    let value = client
        .eval("return ...", vec![Value::from("a"), Value::from("b")], opts)
        .await
        .unwrap()
        .into_value();
    assert_eq!(value, Value::from("a"));

    client.close().await;
}

#[tokio::test]
async fn call_reports_server_errors() {
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();

    let err = client.call("missing", vec![], RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.server_code(), Some(iproto_testkit::ER_NO_SUCH_PROC));

    let err = client.call("", vec![], RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Contract(_)));

    client.close().await;
}

#[tokio::test]
async fn crud_by_space_and_index_name() {
    let instance = MockInstance::builder().space(users()).start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();
    let opts = RequestOptions::new;

    client
        .insert("users", vec![Value::from(1), Value::from("ann")], opts())
        .await
        .unwrap();
    client
        .replace("users", vec![Value::from(2), Value::from("bob")], opts())
        .await
        .unwrap();

    let ops = vec![Value::Array(vec![Value::from("="), Value::from(1), Value::from("cat")])];
    let updated = client
        .update("users", "primary", vec![Value::from(2)], ops, opts())
        .await
        .unwrap();
    assert_eq!(
        updated.into_data(),
        vec![Value::Array(vec![Value::from(2), Value::from("cat")])]
    );

    let found = client
        .select("users", "by_name", vec![Value::from("cat")], SelectParams::all(), opts())
        .await
        .unwrap();
    assert_eq!(found.into_data().len(), 1);

    client
        .upsert("users", vec![Value::from(3), Value::from("dan")], vec![], opts())
        .await
        .unwrap();
    client
        .delete("users", "primary", vec![Value::from(1)], opts())
        .await
        .unwrap();

    let ids: Vec<Value> = instance.rows(512).into_iter().map(|row| row[0].clone()).collect();
    assert_eq!(ids, vec![Value::from(2), Value::from(3)]);

    client.close().await;
}

#[tokio::test]
async fn wrong_password_fails_with_auth_error() {
    let instance = MockInstance::builder().user("alice", "secret").start().await.unwrap();
    let bad = ClientConfig::new(group(&instance, "default", 1).with_credentials("alice", "guess"));
    let err = connect(bad).await.unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)), "{err:?}");

    let good = ClientConfig::new(group(&instance, "default", 1).with_credentials("alice", "secret"));
    let client = connect(good).await.unwrap();
    client.ping(RequestOptions::new()).await.unwrap();
    client.authorize("alice", "secret").await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn unreachable_instance_fails_to_connect() {
    let instance = MockInstance::start().await.unwrap();
    let port = instance.port();
    drop(instance);

    let config = ClientConfig::new(iproto_client::InstanceConnectionGroup::new("gone", "127.0.0.1", port))
        .with_connect_timeout(Duration::from_millis(300));
    let err = connect(config).await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn legacy_server_gets_version_zero() {
    let instance = MockInstance::builder().legacy().space(users()).start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();

    let conn = client.pool().get("default", 0).unwrap();
    assert_eq!(conn.negotiated().version, 0);
    assert_eq!(conn.negotiated().features, FeatureSet::empty());

    let err = client.stream().await.unwrap_err();
    assert!(matches!(err, ClientError::Contract(ref m) if m == STREAMS_UNSUPPORTED));
    let err = client.watch("config", |_| {}).unwrap_err();
    assert!(matches!(err, ClientError::Contract(ref m) if m == WATCHERS_UNSUPPORTED));

    // Names still work: the schema cache turns them into ids.
    client
        .insert("users", vec![Value::from(1)], RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(instance.rows(512).len(), 1);

    client.close().await;
}

#[tokio::test]
async fn watch_once_needs_protocol_six() {
    let old = MockInstance::builder().version(5).start().await.unwrap();
    let client = connect(config(&old, 1)).await.unwrap();
    let err = client.watch_once("config", RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Contract(ref m) if m == WATCH_ONCE_UNSUPPORTED));
    assert_eq!(old.request_count(iproto_common::RequestType::WatchOnce), 0);
    client.close().await;

    let current = MockInstance::start().await.unwrap();
    current.broadcast("config", "v1");
    let client = connect(config(&current, 1)).await.unwrap();
    let value = client.watch_once("config", RequestOptions::new()).await.unwrap();
    assert_eq!(value.into_data(), vec![Value::from("v1")]);
    let missing = client.watch_once("other", RequestOptions::new()).await.unwrap();
    assert!(missing.into_data().is_empty());
    client.close().await;
}

#[tokio::test]
async fn stream_transaction_carries_stream_id() {
    let instance = MockInstance::builder().space(users()).start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();

    let stream = client.stream().await.unwrap();
    stream.begin(Some(Duration::from_secs(5))).unwrap().await.unwrap();
    stream
        .insert(512, vec![Value::from(7), Value::from("tx")], RequestOptions::new())
        .unwrap()
        .await
        .unwrap();
    stream.commit().unwrap().await.unwrap();

    let second = client.stream().await.unwrap();
    assert_ne!(stream.id(), second.id());
    second.begin(None).unwrap().await.unwrap();
    second.rollback().unwrap().await.unwrap();

    assert_eq!(instance.streams_seen(), 2);
    assert_eq!(instance.request_count(iproto_common::RequestType::Begin), 2);
    client.close().await;
}

#[tokio::test]
async fn streams_rejected_without_feature() {
    let instance = MockInstance::builder().without_feature(Feature::Streams).start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();
    let err = client.stream().await.unwrap_err();
    assert!(matches!(err, ClientError::Contract(ref m) if m == STREAMS_UNSUPPORTED));
    client.close().await;
}

#[tokio::test]
async fn metrics_attach_to_one_client() {
    let instance = MockInstance::start().await.unwrap();
    let metrics = Arc::new(ClientMetrics::new());

    let client = Client::connect_with_hooks(config(&instance, 1), hooks().with_metrics(metrics.clone()))
        .await
        .unwrap();
    client.ping(RequestOptions::new()).await.unwrap();
    let snapshot = client.metrics().unwrap().snapshot();
    assert!(snapshot.requests_total >= 1);
    assert_eq!(snapshot.inflight, 0);

    let err = Client::connect_with_hooks(config(&instance, 1), hooks().with_metrics(metrics.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Contract(_)));

    client.close().await;
}

#[tokio::test]
async fn close_leaves_borrowed_runtime_running() {
    let instance = MockInstance::start().await.unwrap();
    let client = connect(config(&instance, 1)).await.unwrap();
    client.close().await;
    assert!(client.is_closed());

    let still_running = tokio::spawn(async { 1 + 1 }).await.unwrap();
    assert_eq!(still_running, 2);
    instance.broadcast("alive", true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owned_runtime_is_shut_down_on_close() {
    let instance = MockInstance::start().await.unwrap();
    let client = Client::connect(config(&instance, 1)).await.unwrap();
    client.ping(RequestOptions::new()).await.unwrap();
    client.close().await;
    assert!(matches!(
        client.ping(RequestOptions::new()).await,
        Err(ClientError::PoolClosed)
    ));
}

#[tokio::test]
async fn connects_from_json_config() {
    let instance = MockInstance::start().await.unwrap();
    let json = format!(
        r#"{{
            "groups": [{{"tag": "main", "host": "{}", "port": {}, "size": 2}}],
            "balancer": "distributing",
            "request_timeout_ms": 1000
        }}"#,
        instance.host(),
        instance.port()
    );
    let config = ClientConfig::from_json(&json).unwrap();
    let client = Client::connect_with_hooks(config, ClientHooks::new().with_runtime(tokio::runtime::Handle::current()))
        .await
        .unwrap();
    assert_eq!(client.balancer().policy_name(), "distributing");
    assert_eq!(client.pool().tags(), vec!["main".to_string()]);
    client.ping(RequestOptions::new()).await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn unknown_balancer_is_a_config_error() {
    let instance = MockInstance::start().await.unwrap();
    let err = connect(config(&instance, 1).with_balancer("random")).await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
    assert_eq!(instance.accepted_connections(), 0);
}
