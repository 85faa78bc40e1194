//! End-to-end session tests against a scripted broker.
//!
//! Each test binds a local listener, plays the broker side of the
//! exchange byte for byte, and asserts what the client puts on the wire
//! and which callbacks fire.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use roost_client::{Client, ClientConfig, MemPersist, PersistStore, Strategy};
use roost_core::{ProtocolVersion, Publish, QoS, Topic};

/// Read one MQTT frame: returns the fixed header byte and the body.
async fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut fixed = [0u8; 1];
    stream.read_exact(&mut fixed).await.ok()?;

    let mut remaining = 0usize;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.ok()?;
        remaining |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await.ok()?;
    Some((fixed[0], body))
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}

fn connack_v311() -> [u8; 4] {
    [0x20, 0x02, 0x00, 0x00]
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_connect_then_clean_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0x10);
        assert_eq!(
            body,
            [0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0A, 0x00, 0x00]
        );
        stream.write_all(&connack_v311()).await.unwrap();

        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0xE0);
        assert!(body.is_empty());

        // Clean socket shutdown follows the DISCONNECT.
        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).await.unwrap(), 0);
    });

    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(10, 1.5),
    )
    .unwrap();

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, err| {
        assert!(err.is_none(), "unexpected connect error: {err:?}");
        let _ = conn_tx.try_send(code);
    })));

    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    client.destroy(false).await;
    within(client.wait()).await;
    within(broker).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn qos1_publish_with_persistence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream).await.unwrap();
        stream.write_all(&connack_v311()).await.unwrap();

        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0x32);
        assert_eq!(body, [0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'h', b'i']);

        stream.write_all(&[0x40, 0x02, 0x00, 0x01]).await.unwrap();

        // Hold the socket open until the client is done.
        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let persist = Arc::new(MemPersist::new(Strategy::default()));
    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(30, 1.5)
            .persist(Arc::clone(&persist) as Arc<dyn PersistStore>),
    )
    .unwrap();

    let (pub_tx, mut pub_rx) = mpsc::channel::<(String, bool)>(4);
    client.handle_pub(move |topic, err| {
        let _ = pub_tx.try_send((topic.to_string(), err.is_none()));
    });

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    client
        .publish(Publish::new("a/b", QoS::AtLeastOnce, "hi"))
        .await;
    // In-flight state is persisted at submission time.
    assert!(persist.load("S1").is_some());

    assert_eq!(
        within(pub_rx.recv()).await,
        Some(("a/b".to_string(), true))
    );

    // The send-side record goes away once the PUBACK is processed.
    within(async {
        while persist.load("S1").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_with_mixed_results() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream).await.unwrap();
        stream.write_all(&connack_v311()).await.unwrap();

        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0x82);
        let id = [body[0], body[1]];

        // Grant QoS 0 and 1, fail the third filter.
        stream
            .write_all(&[0x90, 0x05, id[0], id[1], 0x00, 0x01, 0x80])
            .await
            .unwrap();

        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(30, 1.5),
    )
    .unwrap();

    let (sub_tx, mut sub_rx) = mpsc::channel::<Vec<(String, u8)>>(4);
    client.handle_sub(move |result, err| {
        assert!(err.is_none());
        let _ = sub_tx.try_send(result.to_vec());
    });

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    client
        .subscribe(&[
            Topic::new("x", QoS::AtMostOnce),
            Topic::new("y", QoS::AtLeastOnce),
            Topic::new("z", QoS::ExactlyOnce),
        ])
        .await;

    let result = within(sub_rx.recv()).await.unwrap();
    assert_eq!(
        result,
        vec![
            ("x".to_string(), 0x00),
            ("y".to_string(), 0x01),
            ("z".to_string(), 0x80),
        ]
    );

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn version_downgrade_on_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        // First attempt arrives as MQTT 5 and is refused.
        {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (fixed, body) = read_frame(&mut stream).await.unwrap();
            assert_eq!(fixed, 0x10);
            assert_eq!(body[6], 0x05);
            // MQTT 5 CONNACK: unsupported protocol version, no properties.
            stream.write_all(&[0x20, 0x03, 0x00, 0x84, 0x00]).await.unwrap();
        }

        // The retry arrives as MQTT 3.1.1 on the same server.
        let (mut stream, _) = listener.accept().await.unwrap();
        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0x10);
        assert_eq!(body[6], 0x04);
        stream.write_all(&connack_v311()).await.unwrap();

        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(30, 1.5)
            .version(ProtocolVersion::V5, true),
    )
    .unwrap();

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));

    // The rejection itself is silent; only the downgraded success is
    // reported.
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));
    assert!(conn_rx.try_recv().is_err());

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn keepalive_timeout_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        // First session: answer the handshake, swallow the PINGREQ, and
        // keep the socket open so only the keepalive timeout can end it.
        let (mut first, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut first).await.unwrap();
        first.write_all(&connack_v311()).await.unwrap();

        let (fixed, _) = read_frame(&mut first).await.unwrap();
        assert_eq!(fixed, 0xC0);
        // No PINGRESP: the client must give up on this connection.

        // The client comes back after the keepalive timeout and backoff.
        let (mut stream, _) = listener.accept().await.unwrap();
        drop(first);
        let _ = read_frame(&mut stream).await.unwrap();
        stream.write_all(&connack_v311()).await.unwrap();

        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(1, 1.5)
            .auto_reconnect(true)
            .backoff(Duration::from_millis(50), Duration::from_secs(1), 2.0),
    )
    .unwrap();

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));

    assert_eq!(within(conn_rx.recv()).await, Some(0x00));
    // Second success only happens if the timed-out connection was
    // replaced.
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn qos2_receive_is_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // PUBLISH qos2 id=9 topic "sensor" payload "x".
    let publish = [
        0x34, 0x0B, 0x00, 0x06, b's', b'e', b'n', b's', b'o', b'r', 0x00, 0x09, b'x',
    ];

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream).await.unwrap();
        stream.write_all(&connack_v311()).await.unwrap();

        // The same frame twice: a retransmission.
        stream.write_all(&publish).await.unwrap();
        stream.write_all(&publish).await.unwrap();

        // One PUBREC per PUBLISH.
        for _ in 0..2 {
            let (fixed, body) = read_frame(&mut stream).await.unwrap();
            assert_eq!(fixed, 0x50);
            assert_eq!(body, [0x00, 0x09]);
        }

        stream.write_all(&[0x62, 0x02, 0x00, 0x09]).await.unwrap();

        let (fixed, body) = read_frame(&mut stream).await.unwrap();
        assert_eq!(fixed, 0x70);
        assert_eq!(body, [0x00, 0x09]);

        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let persist = Arc::new(MemPersist::new(Strategy::default()));
    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(true)
            .keepalive(30, 1.5)
            .persist(Arc::clone(&persist) as Arc<dyn PersistStore>),
    )
    .unwrap();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&deliveries);
    client.handle(
        "sensor",
        Arc::new(move |topic, qos, payload| {
            assert_eq!(topic, "sensor");
            assert_eq!(qos, QoS::ExactlyOnce);
            assert_eq!(payload, b"x");
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    // Wait for the whole exchange to play out on the broker side.
    within(async {
        while deliveries.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    // The release marker replaced the held PUBLISH.
    assert!(matches!(
        persist.load("R9"),
        Some(roost_core::Packet::Pubrel(_))
    ));

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn qos1_publish_survives_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let broker = tokio::spawn(async move {
        // First session: take the PUBLISH but never acknowledge it.
        {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await.unwrap();
            stream.write_all(&connack_v311()).await.unwrap();

            let (fixed, _) = read_frame(&mut stream).await.unwrap();
            assert_eq!(fixed & 0xF0, 0x30);
            // Socket loss right after the publish.
        }

        // Second session: the client resumes the exchange.
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_frame(&mut stream).await.unwrap();
        stream.write_all(&connack_v311()).await.unwrap();

        // The unacknowledged publish shows up again; acknowledge the
        // first copy that does.
        let id = loop {
            let (fixed, body) = read_frame(&mut stream).await.unwrap();
            if fixed & 0xF0 == 0x30 {
                // topic "a/b" then the packet id.
                break [body[5], body[6]];
            }
        };
        assert_eq!(id, [0x00, 0x01]);

        stream.write_all(&[0x40, 0x02, id[0], id[1]]).await.unwrap();

        let mut rest = [0u8; 1];
        let _ = stream.read(&mut rest).await;
    });

    let persist = Arc::new(MemPersist::new(Strategy::default()));
    let client = Client::new(
        ClientConfig::new()
            .server(addr.to_string())
            .clean_session(false)
            .keepalive(30, 1.5)
            .auto_reconnect(true)
            .backoff(Duration::from_millis(50), Duration::from_secs(1), 2.0)
            .persist(Arc::clone(&persist) as Arc<dyn PersistStore>),
    )
    .unwrap();

    let acked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&acked);
    client.handle_pub(move |topic, err| {
        assert_eq!(topic, "a/b");
        assert!(err.is_none());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (conn_tx, mut conn_rx) = mpsc::channel::<u8>(4);
    client.connect(Some(Arc::new(move |_, code, _| {
        let _ = conn_tx.try_send(code);
    })));
    assert_eq!(within(conn_rx.recv()).await, Some(0x00));

    client
        .publish(Publish::new("a/b", QoS::AtLeastOnce, "hi"))
        .await;

    // The callback fires exactly once, on the second connection.
    within(async {
        while acked.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(acked.load(Ordering::SeqCst), 1);

    // The send-side record is gone once the exchange completed.
    within(async {
        while persist.load("S1").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    client.destroy(true).await;
    within(client.wait()).await;
    broker.abort();
}
