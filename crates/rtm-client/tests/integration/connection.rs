//! Shared connection: request completion, reconnect backoff, size limit,
//! peer routing and environment changes.

use std::time::Duration;

use rtm_client::connection::{ConnectionEvent, ConnectionHandle, Environment};
use rtm_client::{DisconnectCause, RtmError};
use rtm_protocol::{AckMessage, Command, CommandBody, CommandKind, DirectMessage, ProtocolVariant};
use tokio::sync::mpsc;

use crate::harness::{wait_until, TestBed, APP_ID};

fn direct(text: &str) -> Command {
    Command::new(CommandBody::Direct(DirectMessage {
        cid: Some("c1".into()),
        msg: Some(text.into()),
        ..Default::default()
    }))
}

fn ack_for(request: &Command, mid: &str) -> Command {
    let mut ack = Command::new(CommandBody::Ack(AckMessage {
        mid: Some(mid.into()),
        t: Some(1_000),
        ..Default::default()
    }));
    ack.i = request.i;
    ack
}

async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    predicate: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let event = rx.recv().await.expect("connection event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timeout waiting for connection event")
}

async fn connected_peer(
    bed: &TestBed,
    peer: &str,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let conn = bed
        .registry
        .acquire(APP_ID, ProtocolVariant::default(), peer)
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.connect(peer, tx);
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    (conn, rx)
}

/// A timed-out request resolves once; its late reply is dropped and the
/// next request is answered normally.
#[tokio::test(start_paused = true)]
async fn test_request_timeout_then_late_reply_dropped() {
    let bed = TestBed::new();
    let (conn, mut rx) = connected_peer(&bed, "alice").await;

    let err = conn
        .request("alice", direct("hello"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, RtmError::CommandTimeout));

    let first = bed.gateway.sent_matching(|c| c.kind() == CommandKind::Direct);
    assert_eq!(first.len(), 1);
    assert!(first[0].i.is_some());
    bed.gateway.push(ack_for(&first[0], "late"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "late reply must not reach the peer");

    bed.gateway.respond_with(|c| match c.kind() {
        CommandKind::Direct => vec![ack_for(c, "m2")],
        _ => Vec::new(),
    });
    let reply = conn
        .request("alice", direct("again"), Duration::from_secs(5))
        .await
        .unwrap();
    match reply.body {
        CommandBody::Ack(ack) => assert_eq!(ack.mid.as_deref(), Some("m2")),
        other => panic!("expected ack, got {other:?}"),
    }
}

/// Losing the socket fails the outstanding request exactly once, then the
/// connection comes back on its own.
#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_outstanding_and_reconnects() {
    let bed = TestBed::new();
    let (conn, mut rx) = connected_peer(&bed, "alice").await;

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.request("alice", direct("in flight"), Duration::from_secs(30))
                .await
        })
    };
    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(5), "direct sent", move || {
        gateway.sent().iter().any(|c| c.kind() == CommandKind::Direct)
    })
    .await;

    bed.gateway.drop_socket();
    let result = pending.await.unwrap();
    assert!(result.unwrap_err().is_connection_lost());

    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::InConnecting)).await;
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    assert_eq!(bed.gateway.socket_count(), 2);

    // Nothing else surfaces once the deadline of the failed request passes.
    tokio::time::sleep(Duration::from_secs(40)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(event, ConnectionEvent::Command(_)),
            "unexpected {event:?}"
        );
    }
}

/// Consecutive failures back off 1, 2, 4, 8, 16 then cap at 30 seconds.
#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_schedule() {
    let bed = TestBed::new();
    bed.gateway.set_refuse(true);

    let conn = bed
        .registry
        .acquire(APP_ID, ProtocolVariant::default(), "alice")
        .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    conn.connect("alice", tx);

    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(300), "eight attempts", move || {
        gateway.attempts().len() >= 8
    })
    .await;

    let attempts = bed.gateway.attempts();
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| {
            let ms = w[1].duration_since(w[0]).as_millis() as u64;
            (ms + 500) / 1000
        })
        .collect();
    assert_eq!(&gaps[..7], &[1, 2, 4, 8, 16, 30, 30]);
}

/// A successful connect clears the failure count, so the next loss retries
/// after the base delay again.
#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_connect() {
    let bed = TestBed::new();
    bed.gateway.set_refuse(true);

    let conn = bed
        .registry
        .acquire(APP_ID, ProtocolVariant::default(), "alice")
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.connect("alice", tx);

    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(60), "four refused attempts", move || {
        gateway.attempts().len() >= 4
    })
    .await;
    bed.gateway.set_refuse(false);
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    assert_eq!(bed.gateway.attempts().len(), 5);

    bed.gateway.drop_socket();
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
    let lost = tokio::time::Instant::now();
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;

    let attempts = bed.gateway.attempts();
    assert_eq!(attempts.len(), 6);
    let gap_ms = attempts[5].duration_since(lost).as_millis() as u64;
    assert_eq!((gap_ms + 500) / 1000, 1);
}

/// A peer joining while a retry is scheduled waits for that retry.
#[tokio::test(start_paused = true)]
async fn test_register_during_backoff_keeps_schedule() {
    let bed = TestBed::new();
    bed.gateway.set_refuse(true);

    let alice = bed
        .registry
        .acquire(APP_ID, ProtocolVariant::default(), "alice")
        .unwrap();
    let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
    alice.connect("alice", alice_tx);
    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(5), "first attempt", move || {
        gateway.attempts().len() == 1
    })
    .await;

    let bob = bed
        .registry
        .acquire(APP_ID, ProtocolVariant::default(), "bob")
        .unwrap();
    let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
    bob.connect("bob", bob_tx);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bed.gateway.attempts().len(), 1);

    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(5), "scheduled retry", move || {
        gateway.attempts().len() >= 2
    })
    .await;
    let attempts = bed.gateway.attempts();
    let gap_ms = attempts[1].duration_since(attempts[0]).as_millis() as u64;
    assert_eq!((gap_ms + 500) / 1000, 1);
}

/// An idle link is pinged every 180 seconds; an unanswered ping drops the
/// socket after 20 seconds and the connection comes back.
#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_and_timeout() {
    let bed = TestBed::new();
    let (_conn, mut rx) = connected_peer(&bed, "alice").await;

    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(5), "first ping", move || gateway.pings() == 1).await;
    let first = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(170)).await;
    assert_eq!(bed.gateway.pings(), 1, "no ping before the idle interval");

    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(30), "second ping", move || gateway.pings() == 2).await;
    assert!(first.elapsed() >= Duration::from_secs(180));

    bed.gateway.mute_pongs(true);
    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(200), "unanswered ping", move || {
        gateway.pings() == 3
    })
    .await;
    let unanswered = tokio::time::Instant::now();

    let event = expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
    assert!(matches!(event, ConnectionEvent::Disconnected(e) if e.is_connection_lost()));
    let waited = unanswered.elapsed().as_secs();
    assert!((20..=22).contains(&waited), "ping timed out after {waited}s");
    assert_eq!(bed.gateway.socket_count(), 1);

    bed.gateway.mute_pongs(false);
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    assert_eq!(bed.gateway.socket_count(), 2);
}

/// Commands over the size limit are rejected before reaching the socket.
#[tokio::test(start_paused = true)]
async fn test_oversize_command_never_sent() {
    let bed = TestBed::new();
    let (conn, _rx) = connected_peer(&bed, "alice").await;

    let err = conn
        .request("alice", direct(&"x".repeat(6000)), Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        RtmError::CommandTooLarge { size, max } => {
            assert!(size > 6000);
            assert_eq!(max, 5000);
        }
        other => panic!("expected CommandTooLarge, got {other:?}"),
    }
    assert!(bed
        .gateway
        .sent_matching(|c| c.kind() == CommandKind::Direct)
        .is_empty());
}

/// Two peers share one socket; sends are stamped with the sender and
/// inbound commands go only to the addressed peer.
#[tokio::test(start_paused = true)]
async fn test_peers_share_socket_and_route_by_peer_id() {
    let bed = TestBed::new();
    let (alice_conn, mut alice_rx) = connected_peer(&bed, "alice").await;
    let (bob_conn, mut bob_rx) = connected_peer(&bed, "bob").await;
    assert!(alice_conn.same_connection(&bob_conn));
    assert_eq!(bed.gateway.socket_count(), 1);

    bob_conn.send("bob", direct("from bob"));
    let gateway = bed.gateway.clone();
    wait_until(Duration::from_secs(5), "bob's send", move || {
        !gateway
            .sent_matching(|c| c.kind() == CommandKind::Direct)
            .is_empty()
    })
    .await;
    let sent = bed.gateway.sent_matching(|c| c.kind() == CommandKind::Direct);
    assert_eq!(sent[0].peer_id.as_deref(), Some("bob"));

    bed.gateway.push(direct("to bob").with_peer("bob"));
    let event = expect_event(&mut bob_rx, |e| matches!(e, ConnectionEvent::Command(_))).await;
    let ConnectionEvent::Command(command) = event else {
        unreachable!()
    };
    assert_eq!(command.peer_id.as_deref(), Some("bob"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = alice_rx.try_recv() {
        assert!(!matches!(event, ConnectionEvent::Command(_)));
    }

    // Unaddressed commands go to the first registered peer.
    bed.gateway.push(direct("to whoever"));
    expect_event(&mut alice_rx, |e| matches!(e, ConnectionEvent::Command(_))).await;
}

/// Goaway drops the cached route and reconnects through a fresh lookup.
#[tokio::test(start_paused = true)]
async fn test_goaway_reroutes() {
    let bed = TestBed::new();
    let (_conn, mut rx) = connected_peer(&bed, "alice").await;
    assert_eq!(bed.http.requests_to("/v1/route").len(), 1);

    bed.gateway.push(Command::new(CommandBody::Goaway));
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    assert_eq!(bed.http.requests_to("/v1/route").len(), 2);
    assert_eq!(bed.gateway.socket_count(), 2);
}

/// Losing the network disconnects without retrying; regaining it reconnects.
#[tokio::test(start_paused = true)]
async fn test_network_loss_pauses_reconnects() {
    let bed = TestBed::new();
    let (_conn, mut rx) = connected_peer(&bed, "alice").await;

    bed.registry.set_environment(Environment {
        foreground: true,
        network: None,
    });
    let event = expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Disconnected(_))).await;
    assert!(matches!(
        event,
        ConnectionEvent::Disconnected(RtmError::ConnectionLost(DisconnectCause::NetworkUnavailable))
    ));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(bed.gateway.attempts().len(), 1);

    bed.registry.set_environment(Environment::default());
    expect_event(&mut rx, |e| matches!(e, ConnectionEvent::Connected)).await;
    assert_eq!(bed.gateway.attempts().len(), 2);
}

/// Releasing the last peer tears the socket down.
#[tokio::test(start_paused = true)]
async fn test_release_last_peer_disconnects() {
    let bed = TestBed::new();
    let (_conn, _rx) = connected_peer(&bed, "alice").await;
    assert_eq!(bed.registry.peer_count(APP_ID, ProtocolVariant::default()), 1);

    bed.registry
        .release(APP_ID, ProtocolVariant::default(), "alice");
    assert_eq!(bed.registry.peer_count(APP_ID, ProtocolVariant::default()), 0);
}
