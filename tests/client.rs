//! Client behavior against an in-process broker.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use natwire::{
    Client, ClientBuilder, ConnectionCluster, ConnectionInfo, Message, NatwireError, NoopLogger,
};
use support::{eventually, FakeBroker};
use tokio::sync::mpsc;

fn builder() -> ClientBuilder {
    Client::builder()
        .logger(Arc::new(NoopLogger))
        .reconnect_delay(Duration::from_millis(20))
}

async fn connect(broker: &FakeBroker) -> Client {
    builder().connect(broker.info()).await.unwrap()
}

/// Callback that forwards every delivery to a channel.
fn collector() -> (
    impl Fn(Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |message: Message| {
        let _ = tx.send(message);
    };
    (callback, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within 2s")
        .expect("channel open")
}

/// True unless a message arrives within `wait`. A closed channel means the
/// callback was dropped, which counts as no delivery.
async fn nothing_within(rx: &mut mpsc::UnboundedReceiver<Message>, wait: Duration) -> bool {
    !matches!(tokio::time::timeout(wait, rx.recv()).await, Ok(Some(_)))
}

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    let (callback, mut rx) = collector();
    let id = client.subscribe("greet.*", callback).await.unwrap();
    assert_eq!(id, 1);

    client.publish("greet.world", "hello").await.unwrap();
    let message = next(&mut rx).await;
    assert_eq!(message.subject, "greet.world");
    assert_eq!(message.subscriber_id, 1);
    assert!(message.reply_to.is_none());
    assert_eq!(&message.payload[..], b"hello");

    client
        .publish_with_reply_to("greet.you", "_INBOX.7", vec![0u8, b'\r', b'\n', 0xFF])
        .await
        .unwrap();
    let message = next(&mut rx).await;
    assert_eq!(message.reply_to.as_deref(), Some("_INBOX.7"));
    assert_eq!(&message.payload[..], &[0u8, b'\r', b'\n', 0xFF]);
}

#[tokio::test]
async fn test_subscription_ids_are_monotonic() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    assert_eq!(client.subscribe("a", |_| {}).await.unwrap(), 1);
    assert_eq!(client.subscribe("b", |_| {}).await.unwrap(), 2);
    client.unsubscribe(1).await.unwrap();
    assert_eq!(client.subscribe("c", |_| {}).await.unwrap(), 3);

    assert_eq!(client.subscription_count(), 2);
    assert_eq!(broker.sub_lines(), vec!["SUB a 1", "SUB b 2", "SUB c 3"]);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    let (callback, mut rx) = collector();
    let id = client.subscribe("news", callback).await.unwrap();
    client.unsubscribe(id).await.unwrap();
    assert_eq!(client.subscription_count(), 0);

    client.publish("news", "late").await.unwrap();
    assert!(nothing_within(&mut rx, Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_unsubscribe_all_matches_subject() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    client.subscribe("x", |_| {}).await.unwrap();
    client.subscribe("y", |_| {}).await.unwrap();
    client.subscribe("x", |_| {}).await.unwrap();

    client.unsubscribe_all("x").await.unwrap();
    assert_eq!(client.subscription_count(), 1);

    client.unsubscribe_all("nothing").await.unwrap();
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn test_message_for_unknown_subscriber_is_dropped() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    let (callback, mut rx) = collector();
    let id = client.subscribe("a", callback).await.unwrap();
    client.unsubscribe(id).await.unwrap();

    broker.inject(b"MSG a 1 2\r\nhi\r\n");
    assert!(nothing_within(&mut rx, Duration::from_millis(100)).await);

    // The stray message did not disturb the connection.
    assert!(client.ping().await);
    client.publish("a", "still fine").await.unwrap();
}

#[tokio::test]
async fn test_oversized_publish_keeps_connection_usable() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    let (callback, mut rx) = collector();
    client.subscribe("big", callback).await.unwrap();

    let payload = vec![b'x'; support::MAX_PAYLOAD + 1];
    match client.publish("big", payload).await {
        Err(NatwireError::Protocol(message)) => assert_eq!(message, "Maximum Payload Violation"),
        other => panic!("expected protocol error, got {:?}", other),
    }

    client.publish("big", "small").await.unwrap();
    assert_eq!(&next(&mut rx).await.payload[..], b"small");
}

#[tokio::test]
async fn test_concurrent_publishes_are_all_acked() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    let (callback, mut rx) = collector();
    client.subscribe("burst", callback).await.unwrap();

    let publishes: Vec<_> = (0..20)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.publish("burst", format!("{}", i)).await })
        })
        .collect();
    for publish in publishes {
        publish.await.unwrap().unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        let message = next(&mut rx).await;
        seen.push(String::from_utf8(message.payload.to_vec()).unwrap());
    }
    seen.sort_by_key(|s| s.parse::<u32>().unwrap());
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_reconnect_resubscribes_before_serving() {
    let broker = FakeBroker::start().await;
    let connected = Arc::new(AtomicUsize::new(0));
    let counter = connected.clone();

    let client = builder()
        .on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect(broker.info())
        .await
        .unwrap();
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    let (callback_a, mut rx_a) = collector();
    client.subscribe("a", callback_a).await.unwrap();
    client.subscribe("b", |_| {}).await.unwrap();

    broker.kill_connections();
    eventually(|| connected.load(Ordering::SeqCst) == 2).await;

    assert_eq!(
        broker.sub_lines(),
        vec!["SUB a 1", "SUB b 2", "SUB a 1", "SUB b 2"]
    );
    assert_eq!(broker.accepted(), 2);

    client.publish("a", "after").await.unwrap();
    assert_eq!(&next(&mut rx_a).await.payload[..], b"after");
}

#[tokio::test]
async fn test_calls_during_reconnect_wait_for_resubscription() {
    let broker = FakeBroker::start().await;
    let connected = Arc::new(AtomicUsize::new(0));
    let counter = connected.clone();

    let client = builder()
        .on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect(broker.info())
        .await
        .unwrap();

    let (callback, mut rx) = collector();
    client.subscribe("a", callback).await.unwrap();
    client.subscribe("b", |_| {}).await.unwrap();

    broker.hold_handshakes(true);
    broker.kill_connections();
    let before_kill = broker.control_lines().len();
    eventually(|| broker.accepted() == 2).await;

    // The replacement connection is still handshaking: this call must queue.
    let publish = {
        let client = client.clone();
        tokio::spawn(async move { client.publish("a", "queued").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!publish.is_finished());

    broker.hold_handshakes(false);
    publish.await.unwrap().unwrap();

    // Served only after the connected callback ran.
    assert_eq!(connected.load(Ordering::SeqCst), 2);
    assert_eq!(
        broker.control_lines()[before_kill..],
        ["SUB a 1", "SUB b 2", "PUB a 6"]
    );
    assert_eq!(&next(&mut rx).await.payload[..], b"queued");
}

#[tokio::test]
async fn test_transport_failure_never_surfaces_as_io() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;

    broker.kill_connections();
    // Served either by the dying connection or by its replacement.
    match client.publish("any", "x").await {
        Ok(()) | Err(NatwireError::Disconnected) => {}
        other => panic!("unexpected result {:?}", other),
    }

    eventually(|| broker.accepted() == 2).await;
    client.publish("any", "y").await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let broker = FakeBroker::start().await;
    let client = connect(&broker).await;
    assert!(client.ping().await);

    client.disconnect();
    client.disconnect();
    assert!(client.is_disconnected());

    assert!(matches!(
        client.publish("a", "x").await,
        Err(NatwireError::Disconnected)
    ));
    assert!(matches!(
        client.unsubscribe(1).await,
        Err(NatwireError::Disconnected)
    ));
    assert!(!client.ping().await);

    eventually(|| broker.live_connections() == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.accepted(), 1);
}

#[tokio::test]
async fn test_auth_failure_is_reported_verbatim() {
    let broker = FakeBroker::start().await;

    let result = builder()
        .connect(broker.info_with("nats", "wrong"))
        .await;
    match result {
        Err(NatwireError::Protocol(message)) => assert_eq!(message, "Authorization Violation"),
        other => panic!("expected protocol error, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.accepted(), 1);
}

#[tokio::test]
async fn test_connect_refused() {
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let info = ConnectionInfo::new(addr, "nats", "nats").with_logger(Arc::new(NoopLogger));
    assert!(matches!(
        builder().connect(info).await,
        Err(NatwireError::Io(_))
    ));
}

#[tokio::test]
async fn test_cluster_skips_dead_member() {
    let broker = FakeBroker::start().await;
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };

    let cluster = ConnectionCluster::from_infos(vec![
        ConnectionInfo::new(dead, "nats", "nats").with_logger(Arc::new(NoopLogger)),
        broker.info(),
    ])
    .with_logger(Arc::new(NoopLogger));

    let client = builder().connect(cluster).await.unwrap();
    assert!(client.ping().await);
}
