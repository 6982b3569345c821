use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::{
    Client, ClientError, Config, Dir, ReadError, Role, Server, Session, SessionError,
    TransportAction, TransportEvent,
};

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn test_url() -> Url {
    "https://example.com/chat".parse().unwrap()
}

async fn pair_with(configure: impl FnOnce(&mut Config)) -> (Session, Session) {
    let mut config = Config {
        connect_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    configure(&mut config);

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Client::new(config.clone());
    let server = Server::new(config);

    let (client_session, server_session) = tokio::join!(
        client.connect(client_io, test_url()),
        async {
            let request = server.accept(server_io).await?;
            assert_eq!(request.url(), &test_url());
            request.ok().await
        }
    );
    (client_session.unwrap(), server_session.unwrap())
}

async fn pair() -> (Session, Session) {
    pair_with(|_| {}).await
}

#[tokio::test]
async fn bi_echo() -> anyhow::Result<()> {
    init();
    let (client, server) = pair().await;
    client.ready().await?;
    server.ready().await?;

    let client_task = tokio::spawn({
        let client = client.clone();
        async move {
            let (mut send, mut recv) = client.open_bi().await.unwrap();
            send.write(b"hello").await.unwrap();
            send.finish().await.unwrap();

            let echoed = recv.read_to_end(64).await.unwrap();
            assert_eq!(echoed, b"world");
            // End-of-stream is stable after the final flag.
            assert_eq!(recv.read_chunk(1).await.unwrap(), None);
        }
    });

    let (mut send, mut recv) = server.accept_bi().await?;
    let got = recv.read_to_end(64).await?;
    assert_eq!(got, b"hello");
    send.write(b"world").await?;
    send.finish().await?;

    client_task.await?;
    Ok(())
}

#[tokio::test]
async fn uni_stream_preserves_order_with_one_eos() -> anyhow::Result<()> {
    init();
    let (client, server) = pair().await;

    let mut send = client.open_uni().await?;
    for chunk in [&b"one"[..], b"two", b"three"] {
        send.write(chunk).await?;
    }
    send.finish().await?;

    let mut recv = server.accept_uni().await?;
    let got = recv.read_to_end(64).await?;
    assert_eq!(got, b"onetwothree");
    assert_eq!(recv.read_chunk(1).await?, None);
    assert_eq!(recv.read_chunk(1).await?, None);
    Ok(())
}

#[tokio::test]
async fn stream_limit_queues_then_releases_in_fifo_order() {
    init();
    let (client, server) = pair_with(|c| c.max_streams_bidi = 3).await;

    let mut handles: Vec<_> = (0..5)
        .map(|_| {
            let session = client.clone();
            tokio::spawn(async move { session.open_bi().await })
        })
        .collect();
    sleep(Duration::from_millis(50)).await;

    let settled = handles.iter().filter(|h| h.is_finished()).count();
    assert_eq!(settled, 3, "exactly the advertised limit settles");

    // Terminating one granted stream releases exactly one queued request.
    let first = handles.remove(0);
    let (mut send, mut recv) = first.await.unwrap().unwrap();
    assert_eq!(send.id(), 0);
    send.reset(1);
    recv.stop(1);
    sleep(Duration::from_millis(50)).await;

    let mut granted_ids = Vec::new();
    let mut still_pending = 0;
    for handle in handles {
        if handle.is_finished() {
            let (send, _recv) = handle.await.unwrap().unwrap();
            granted_ids.push(send.id());
        } else {
            handle.abort();
            still_pending += 1;
        }
    }
    granted_ids.sort_unstable();
    assert_eq!(granted_ids, vec![4, 8, 12], "released slot went to the queue head");
    assert_eq!(still_pending, 1);

    drop(server);
}

#[tokio::test]
async fn reset_discards_buffered_data() {
    init();
    let (client, server) = pair().await;

    let (mut send, _recv) = client.open_bi().await.unwrap();
    send.write(b"doomed").await.unwrap();

    let (_s, mut recv) = server.accept_bi().await.unwrap();
    // Let the data land before the reset chases it.
    sleep(Duration::from_millis(20)).await;
    send.reset(42);
    sleep(Duration::from_millis(20)).await;

    match recv.read_chunk(64).await {
        Err(ReadError::Reset(42)) => {}
        other => panic!("expected reset, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_receiving_fails_the_writer() {
    init();
    let (client, server) = pair().await;

    let (mut send, _recv) = client.open_bi().await.unwrap();
    send.write(b"ping").await.unwrap();

    let (_s, mut recv) = server.accept_bi().await.unwrap();
    recv.stop(9);
    sleep(Duration::from_millis(20)).await;

    // The stop propagates back and fails further writes.
    let mut failed = false;
    for _ in 0..50 {
        if send.write(b"more").await.is_err() {
            failed = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(failed, "writes keep succeeding after stop-sending");
}

#[tokio::test]
async fn datagrams_are_best_effort_and_never_block() {
    init();
    let (client, server) = pair_with(|c| {
        c.datagram_send_queue = 8;
        c.datagram_recv_queue = 8;
    })
    .await;

    // A burst far beyond every queue bound; send_datagram never suspends.
    for i in 0..512u32 {
        client
            .send_datagram(Bytes::copy_from_slice(&i.to_be_bytes()))
            .unwrap();
    }

    let first = timeout(Duration::from_secs(1), server.read_datagram())
        .await
        .expect("a datagram survives the burst")
        .unwrap();
    assert_eq!(first.len(), 4);

    let stats = client.stats().await;
    assert!(stats.datagrams_sent >= 1);
    assert!(stats.datagrams_dropped > 0, "saturation must drop, not block");
}

#[tokio::test]
async fn close_round_trips_code_and_reason() {
    init();
    let (client, server) = pair().await;

    client.close(7, "this is the reason").unwrap();

    let expected = SessionError::Closed {
        code: 7,
        reason: "this is the reason".into(),
    };
    assert_eq!(server.closed().await, expected);
    assert_eq!(client.closed().await, expected);
}

#[tokio::test]
async fn dropping_the_session_closes_with_defaults() {
    init();
    let (client, server) = pair().await;
    drop(client);

    assert_eq!(
        server.closed().await,
        SessionError::Closed {
            code: 0,
            reason: String::new(),
        }
    );
}

#[tokio::test]
async fn close_is_idempotent() {
    init();
    let (client, server) = pair().await;

    client.close(7, "first").unwrap();
    client.close(9, "second").unwrap();

    let expected = SessionError::Closed {
        code: 7,
        reason: "first".into(),
    };
    assert_eq!(client.closed().await, expected);
    assert_eq!(server.closed().await, expected);
}

#[tokio::test]
async fn oversized_close_reason_is_rejected_locally() {
    init();
    let (client, server) = pair().await;

    let reason = "x".repeat(crate::MAX_REASON_LEN + 1);
    assert_eq!(
        client.close(1, &reason),
        Err(SessionError::ReasonTooLong)
    );

    // The session is still alive afterwards.
    client.close(2, "ok").unwrap();
    assert_eq!(
        server.closed().await,
        SessionError::Closed {
            code: 2,
            reason: "ok".into(),
        }
    );
}

#[tokio::test]
async fn rejected_upgrade_never_creates_a_session() {
    init();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let client = Client::new(Config::default());
    let server = Server::new(Config::default());

    let (client_res, server_res) = tokio::join!(client.connect(client_io, test_url()), async {
        let request = server.accept(server_io).await.unwrap();
        request.close(StatusCode::FORBIDDEN).await
    });

    server_res.unwrap();
    match client_res {
        Err(ClientError::Rejected(status)) => assert_eq!(status, StatusCode::FORBIDDEN),
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn drain_notifies_but_keeps_streams_usable() {
    init();
    let (client, server) = pair().await;

    let (mut send, _recv) = client.open_bi().await.unwrap();
    send.write(b"before").await.unwrap();
    let (mut s_send, mut s_recv) = server.accept_bi().await.unwrap();

    server.drain();
    client.draining().await.unwrap();

    // Existing streams keep flowing while draining.
    send.write(b" after").await.unwrap();
    send.finish().await.unwrap();
    assert_eq!(s_recv.read_to_end(64).await.unwrap(), b"before after");
    s_send.finish().await.unwrap();
}

#[tokio::test]
async fn handshake_timeout_fails_ready_and_closed() {
    init();
    let (event_tx, event_rx) = mpsc::channel(4);
    let (action_tx, action_rx) = mpsc::channel(4);
    let config = Config {
        connect_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let session = Session::attach(Role::Client, config, event_rx, action_tx, None);

    assert_eq!(session.ready().await, Err(SessionError::HandshakeTimeout));
    assert_eq!(session.closed().await, SessionError::HandshakeTimeout);

    drop(event_tx);
    drop(action_rx);
}

#[tokio::test]
async fn handshake_failure_is_reported_to_both_observers() {
    init();
    let (event_tx, event_rx) = mpsc::channel(4);
    let (action_tx, action_rx) = mpsc::channel(4);
    let session = Session::attach(Role::Client, Config::default(), event_rx, action_tx, None);

    event_tx
        .send(TransportEvent::HandshakeFailed {
            message: "tls says no".into(),
        })
        .await
        .unwrap();

    let err = SessionError::HandshakeFailed("tls says no".into());
    assert_eq!(session.ready().await, Err(err.clone()));
    assert_eq!(session.closed().await, err);

    drop(action_rx);
}

#[tokio::test]
async fn native_attach_respects_stream_credit() {
    init();
    let (event_tx, event_rx) = mpsc::channel(16);
    let (action_tx, mut action_rx) = mpsc::channel(16);
    let config = Config {
        initial_send_credit: 4,
        ..Config::default()
    };
    let session = Session::attach(Role::Client, config, event_rx, action_tx, None);

    event_tx.send(TransportEvent::Ready).await.unwrap();
    session.ready().await.unwrap();

    let mut send = session.open_uni().await.unwrap();
    match action_rx.recv().await.unwrap() {
        TransportAction::OpenStream { id, dir } => {
            assert_eq!(id, 2);
            assert_eq!(dir, Dir::Uni);
        }
        other => panic!("expected open, got {other:?}"),
    }

    let writer = tokio::spawn(async move {
        send.write(b"0123456789").await.unwrap();
        send
    });

    // Only the credited prefix reaches the transport.
    match action_rx.recv().await.unwrap() {
        TransportAction::Write { id, data, fin } => {
            assert_eq!(id, 2);
            assert_eq!(&data[..], b"0123");
            assert!(!fin);
        }
        other => panic!("expected write, got {other:?}"),
    }
    sleep(Duration::from_millis(20)).await;
    assert!(!writer.is_finished(), "write must wait for credit");

    event_tx
        .send(TransportEvent::StreamCredit { id: 2, max: 100 })
        .await
        .unwrap();
    match action_rx.recv().await.unwrap() {
        TransportAction::Write { data, .. } => assert_eq!(&data[..], b"456789"),
        other => panic!("expected write, got {other:?}"),
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn transport_failure_forces_streams_into_reset() {
    init();
    let (event_tx, event_rx) = mpsc::channel(16);
    let (action_tx, mut action_rx) = mpsc::channel(16);
    let session = Session::attach(Role::Client, Config::default(), event_rx, action_tx, None);

    event_tx.send(TransportEvent::Ready).await.unwrap();
    session.ready().await.unwrap();

    event_tx
        .send(TransportEvent::StreamOpened { id: 1, dir: Dir::Bi })
        .await
        .unwrap();
    let (_send, mut recv) = session.accept_bi().await.unwrap();

    event_tx
        .send(TransportEvent::StreamData {
            id: 1,
            data: Bytes::from_static(b"hi"),
            fin: false,
        })
        .await
        .unwrap();
    assert_eq!(
        recv.read_chunk(16).await.unwrap(),
        Some(Bytes::from_static(b"hi"))
    );

    event_tx
        .send(TransportEvent::TransportError {
            message: "socket died".into(),
        })
        .await
        .unwrap();

    assert!(matches!(
        session.closed().await,
        SessionError::TransportIo(_)
    ));
    assert!(matches!(
        recv.read_chunk(16).await,
        Err(ReadError::Session(SessionError::TransportIo(_)))
    ));

    // The driver tells the carrier nothing; it just stops.
    while let Some(action) = action_rx.recv().await {
        assert!(!matches!(action, TransportAction::Close { .. }));
    }
}

#[tokio::test]
async fn monotonic_stream_ids_are_enforced() {
    init();
    let (event_tx, event_rx) = mpsc::channel(16);
    let (action_tx, mut action_rx) = mpsc::channel(16);
    let session = Session::attach(Role::Server, Config::default(), event_rx, action_tx, None);

    event_tx.send(TransportEvent::Ready).await.unwrap();
    session.ready().await.unwrap();

    for id in [0u64, 8] {
        event_tx
            .send(TransportEvent::StreamOpened { id, dir: Dir::Bi })
            .await
            .unwrap();
        session.accept_bi().await.unwrap();
    }

    // Reusing an id (or going backwards) is rejected with a stop-sending.
    event_tx
        .send(TransportEvent::StreamOpened { id: 4, dir: Dir::Bi })
        .await
        .unwrap();

    let action = timeout(Duration::from_secs(1), action_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(action, TransportAction::StopSending { id: 4, .. }),
        "expected rejection, got {action:?}"
    );
}
