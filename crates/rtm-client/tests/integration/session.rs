//! Session lifecycle over the in-memory gateway: open, close, resume,
//! token expiry, open timeout, server kick, messaging and history.

use std::sync::Arc;
use std::time::Duration;

use rtm_client::{
    ConversationEvent, MessageQuery, MessageStatus, OpenMode, QueryPolicy, RtmError, SendOptions,
    Session, SessionEvent, SessionState,
};
use rtm_client::Message;
use rtm_protocol::{
    AckMessage, Command, CommandBody, CommandKind, ConvMessage, DirectMessage, LogItem,
    LogsMessage, OpType, ProtocolVariant, SessionMessage,
};
use rtm_storage::{LocalStore, SqliteLocalStore};
use serde_json::json;

use crate::harness::{
    default_responder, is_token_open, next_event, opened, reply_to, test_config, wait_until,
    TestBed, APP_ID,
};

const WAIT: Duration = Duration::from_secs(60);

fn opens(bed: &TestBed) -> Vec<SessionMessage> {
    bed.gateway
        .sent_matching(|c| c.is(CommandKind::Session, OpType::Open))
        .into_iter()
        .filter_map(|c| match c.body {
            CommandBody::Session(session) => Some(session),
            _ => None,
        })
        .collect()
}

/// Answers conversation queries for `c1`, directs with an ack and history
/// requests with three messages; sessions behave as usual.
fn messaging_responder(command: &Command) -> Vec<Command> {
    match (&command.body, command.op) {
        (CommandBody::Conv(_), Some(OpType::Query)) => vec![reply_to(
            command,
            CommandBody::Conv(ConvMessage {
                results: Some(json!([{
                    "objectId": "c1",
                    "m": ["alice", "bob"],
                    "c": "bob",
                    "createdAt": "2020-01-01T00:00:00.000Z",
                    "updatedAt": "2020-01-01T00:00:00.000Z",
                }])),
                ..Default::default()
            }),
            OpType::QueryResult,
        )],
        (CommandBody::Direct(_), _) => {
            let mut ack = Command::new(CommandBody::Ack(AckMessage {
                mid: Some("m1".into()),
                t: Some(1_000),
                ..Default::default()
            }));
            ack.i = command.i;
            vec![ack]
        }
        (CommandBody::Logs(_), _) => {
            let logs = (1..=3)
                .rev()
                .map(|n| LogItem {
                    msg_id: format!("h{n}"),
                    timestamp: n * 100,
                    from: Some("bob".into()),
                    data: Some(format!("history {n}")),
                    ..Default::default()
                })
                .collect();
            let mut reply = Command::new(CommandBody::Logs(LogsMessage {
                logs,
                ..Default::default()
            }));
            reply.i = command.i;
            vec![reply]
        }
        _ => default_responder(command),
    }
}

async fn opened_session(bed: &TestBed, store: Option<Arc<dyn LocalStore>>) -> Session {
    let session = bed.session(&test_config("alice"), store);
    session.open(OpenMode::Forced).await.unwrap();
    session
}

#[tokio::test(start_paused = true)]
async fn test_open_then_close() {
    let bed = TestBed::new();
    let session = bed.session(&test_config("alice"), None);
    let mut events = session.events();

    session.open(OpenMode::Forced).await.unwrap();
    assert_eq!(session.state(), SessionState::Opened);
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidOpen)).await;

    let sent = opens(&bed);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].s.as_deref(), Some("sig-alice-1"));
    assert!(sent[0].st.is_none());
    assert!(sent[0].r.is_none());
    assert!(sent[0].ua.as_deref().unwrap().starts_with("rtm-client/"));
    assert!(sent[0].config_bitmap.is_some());
    assert_eq!(session.session_token(false).await.unwrap(), "token-1");

    let err = session.open(OpenMode::Forced).await.unwrap_err();
    assert!(matches!(err, RtmError::SessionStateConflict(_)));

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(bed.registry.peer_count(APP_ID, ProtocolVariant::default()), 0);
    assert!(matches!(session.close().await, Err(RtmError::ClientNotOpen)));
}

/// A dropped socket pauses the session; the reconnect reopens with the
/// session token and the reconnect flag.
#[tokio::test(start_paused = true)]
async fn test_resume_after_disconnect() {
    let bed = TestBed::new();
    let session = opened_session(&bed, None).await;
    let mut events = session.events();

    bed.gateway.drop_socket();
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidPause(_))).await;
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidResume)).await;
    assert_eq!(session.state(), SessionState::Opened);

    let sent = opens(&bed);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].st.as_deref(), Some("token-1"));
    assert_eq!(sent[1].r, Some(true));
    assert!(sent[1].s.is_none());
    assert_eq!(bed.signer.calls(), 1);
}

/// The server clock on the first open seeds the patch mark, which the
/// next open reports back.
#[tokio::test(start_paused = true)]
async fn test_first_open_seeds_patch_mark() {
    let bed = TestBed::new();
    bed.gateway.respond_with(|c| {
        if c.is(CommandKind::Session, OpType::Open) {
            let mut reply = opened(c, "token-1");
            reply.server_ts = Some(1_700_000_000_000);
            vec![reply]
        } else {
            default_responder(c)
        }
    });
    let session = opened_session(&bed, None).await;
    assert_eq!(
        session.local_record().last_patch_timestamp,
        Some(1_700_000_000_000)
    );
    let mut events = session.events();

    bed.gateway.drop_socket();
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidResume)).await;

    let sent = opens(&bed);
    assert_eq!(sent.len(), 2);
    assert!(sent[0].last_patch_time.is_none());
    assert_eq!(sent[1].last_patch_time, Some(1_700_000_000_000));
}

/// Concurrent lookups of an uncached conversation share one query.
#[tokio::test(start_paused = true)]
async fn test_concurrent_lookups_share_one_query() {
    let bed = TestBed::new();
    bed.gateway.respond_with(messaging_responder);
    let session = opened_session(&bed, None).await;

    let (first, second) = tokio::join!(session.conversation("c1"), session.conversation("c1"));
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(
        bed.gateway
            .sent_matching(|c| c.is(CommandKind::Conv, OpType::Query))
            .len(),
        1
    );

    // Cached now; no further query.
    session.conversation("c1").await.unwrap();
    assert_eq!(
        bed.gateway
            .sent_matching(|c| c.is(CommandKind::Conv, OpType::Query))
            .len(),
        1
    );
}

/// An expired token on reopen is dropped and the open is signed again.
#[tokio::test(start_paused = true)]
async fn test_expired_token_reopen_signs_again() {
    let bed = TestBed::new();
    let session = opened_session(&bed, None).await;
    let mut events = session.events();

    bed.gateway.respond_with(|c| {
        if is_token_open(c) {
            vec![reply_to(
                c,
                CommandBody::Session(SessionMessage {
                    code: Some(4112),
                    reason: Some("SESSION_TOKEN_EXPIRED".into()),
                    ..Default::default()
                }),
                OpType::Closed,
            )]
        } else {
            default_responder(c)
        }
    });
    bed.gateway.drop_socket();
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidResume)).await;

    let sent = opens(&bed);
    assert_eq!(sent.len(), 3);
    assert!(sent[1].st.is_some());
    assert_eq!(sent[2].s.as_deref(), Some("sig-alice-2"));
    assert_eq!(bed.signer.calls(), 2);
    assert_eq!(session.state(), SessionState::Opened);
}

/// An open the gateway never answers fails once the open timeout elapses.
#[tokio::test(start_paused = true)]
async fn test_open_timeout() {
    let bed = TestBed::new();
    bed.gateway.respond_with(|_| Vec::new());
    let mut cfg = test_config("alice");
    cfg.session.open_timeout_secs = 5;
    let session = bed.session(&cfg, None);

    let started = tokio::time::Instant::now();
    let err = session.open(OpenMode::Forced).await.unwrap_err();
    assert!(matches!(err, RtmError::CommandTimeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(bed.registry.peer_count(APP_ID, ProtocolVariant::default()), 0);
}

/// A server-initiated close ends the session with the server's error.
#[tokio::test(start_paused = true)]
async fn test_kicked_by_server() {
    let bed = TestBed::new();
    let session = opened_session(&bed, None).await;
    let mut events = session.events();

    bed.gateway.push(
        Command::new(CommandBody::Session(SessionMessage {
            code: Some(4111),
            reason: Some("SESSION_CONFLICT".into()),
            ..Default::default()
        }))
        .with_op(OpType::Closed),
    );
    let event = next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidClose(_))).await;
    let SessionEvent::DidClose(error) = event else {
        unreachable!()
    };
    assert_eq!(error.code(), 4111);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_send_and_receive_message() {
    let bed = TestBed::new();
    bed.gateway.respond_with(messaging_responder);
    let session = opened_session(&bed, None).await;
    let mut events = session.events();

    let conversation = session.conversation("c1").await.unwrap();
    assert_eq!(conversation.members().unwrap(), vec!["alice", "bob"]);

    let mut message = Message::text("hello");
    session
        .send_message(&conversation, &mut message, SendOptions::default())
        .await
        .unwrap();
    assert_eq!(message.id.as_deref(), Some("m1"));
    assert_eq!(message.sent_timestamp, Some(1_000));
    assert_eq!(message.status(), MessageStatus::Sent);
    assert!(message.dedup_token.is_some());
    assert_eq!(
        conversation.last_message().unwrap().id.as_deref(),
        Some("m1")
    );

    let mut inbound = Command::new(CommandBody::Direct(DirectMessage {
        cid: Some("c1".into()),
        id: Some("m2".into()),
        msg: Some("hi alice".into()),
        from_peer_id: Some("bob".into()),
        timestamp: Some(2_000),
        ..Default::default()
    }));
    inbound.server_ts = Some(2_000);
    bed.gateway.push(inbound);

    let event = next_event(&mut events, WAIT, |e| {
        matches!(
            e,
            SessionEvent::Conversation {
                event: ConversationEvent::MessageReceived(_),
                ..
            }
        )
    })
    .await;
    let SessionEvent::Conversation {
        event: ConversationEvent::MessageReceived(received),
        ..
    } = event
    else {
        unreachable!()
    };
    assert!(received.is_inbound());
    assert_eq!(received.id.as_deref(), Some("m2"));

    let gateway = bed.gateway.clone();
    wait_until(WAIT, "ack for m2", move || {
        gateway.sent().iter().any(|c| {
            matches!(&c.body, CommandBody::Ack(ack) if ack.mid.as_deref() == Some("m2"))
        })
    })
    .await;
    assert_eq!(
        conversation.last_message().unwrap().id.as_deref(),
        Some("m2")
    );
    assert_eq!(conversation.unread_count(), 1);
    assert_eq!(session.local_record().last_server_timestamp, Some(2_000));
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_session() {
    let bed = TestBed::new();
    bed.gateway.respond_with(messaging_responder);
    let session = opened_session(&bed, None).await;
    let conversation = session.conversation("c1").await.unwrap();
    session.close().await.unwrap();

    let mut message = Message::text("too late");
    let err = session
        .send_message(&conversation, &mut message, SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RtmError::ClientNotOpen));
    assert_eq!(message.status(), MessageStatus::Failed);
}

/// History is fetched once, cached, then served from the local store.
#[tokio::test(start_paused = true)]
async fn test_history_cached_after_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn LocalStore> =
        Arc::new(SqliteLocalStore::open(&dir.path().join("rtm.db")).unwrap());
    let bed = TestBed::new();
    bed.gateway.respond_with(messaging_responder);
    let session = opened_session(&bed, Some(store)).await;
    let conversation = session.conversation("c1").await.unwrap();

    let fetched = session
        .query_messages(&conversation, MessageQuery::default())
        .await
        .unwrap();
    let ids: Vec<_> = fetched.iter().filter_map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec!["h1", "h2", "h3"]);

    let cached = session
        .query_messages(
            &conversation,
            MessageQuery {
                policy: QueryPolicy::OnlyCache,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let ids: Vec<_> = cached.iter().filter_map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec!["h1", "h2", "h3"]);
    assert_eq!(
        bed.gateway
            .sent_matching(|c| c.kind() == CommandKind::Logs)
            .len(),
        1
    );

    let err = session
        .query_messages(
            &conversation,
            MessageQuery {
                limit: 101,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RtmError::InvalidArgument(_)));
}
