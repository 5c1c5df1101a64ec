//! Offline reconciliation after open and resume.

use std::sync::Arc;
use std::time::Duration;

use rtm_client::{ConversationEvent, OpenMode, SessionEvent};
use rtm_protocol::{Command, CommandBody, ConvMessage, OpType};
use rtm_storage::{LocalRecord, LocalStore, SqliteLocalStore};
use serde_json::{json, Value};

use crate::harness::{default_responder, next_event, reply_to, test_config, wait_until, TestBed};

const WAIT: Duration = Duration::from_secs(60);

fn joined(cid: &str, server_ts: i64, member: &str, udate: &str) -> Value {
    json!({
        "cmd": "conv",
        "op": "members-joined",
        "cid": cid,
        "serverTs": server_ts,
        "m": [member],
        "initBy": "bob",
        "udate": udate,
    })
}

/// Conversation queries for `a` and `b` succeed; sessions behave as usual.
fn query_responder(command: &Command) -> Vec<Command> {
    match (&command.body, command.op) {
        (CommandBody::Conv(_), Some(OpType::Query)) => {
            let results: Vec<Value> = ["a", "b"]
                .iter()
                .map(|id| {
                    json!({
                        "objectId": id,
                        "m": ["alice"],
                        "createdAt": "2021-01-01T00:00:00.000Z",
                        "updatedAt": "2021-01-01T00:00:00.000Z",
                    })
                })
                .collect();
            vec![reply_to(
                command,
                CommandBody::Conv(ConvMessage {
                    results: Some(Value::Array(results)),
                    ..Default::default()
                }),
                OpType::QueryResult,
            )]
        }
        _ => default_responder(command),
    }
}

fn store_with_mark(dir: &tempfile::TempDir, mark: i64) -> Arc<dyn LocalStore> {
    let store = SqliteLocalStore::open(&dir.path().join("rtm.db")).unwrap();
    store
        .write_local_record(
            "alice",
            &LocalRecord {
                last_server_timestamp: Some(mark),
                last_patch_timestamp: None,
            },
        )
        .unwrap();
    Arc::new(store)
}

/// Feed A:510, B:508, A:505, A:520 since mark 500 replays A in server
/// order (505, 510, 520), then B, and leaves the mark at 520.
#[tokio::test(start_paused = true)]
async fn test_offline_events_replayed_in_server_order() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new();
    bed.gateway.respond_with(query_responder);
    bed.http.set_notifications(json!({
        "permanent": {"notifications": [
            joined("a", 510, "m510", "2021-01-02T00:00:00.000Z"),
            joined("b", 508, "m508", "2021-01-02T00:00:00.000Z"),
            joined("a", 505, "m505", "2021-01-01T12:00:00.000Z"),
            joined("a", 520, "m520", "2021-01-03T00:00:00.000Z"),
        ]},
        "droppable": {"notifications": []},
    }));

    let session = bed.session(&test_config("alice"), Some(store_with_mark(&dir, 500)));
    let mut events = session.events();
    session.open(OpenMode::Forced).await.unwrap();

    let mut joined_order = Vec::new();
    while joined_order.len() < 4 {
        let event = next_event(&mut events, WAIT, |e| {
            matches!(
                e,
                SessionEvent::Conversation {
                    event: ConversationEvent::MembersJoined { .. },
                    ..
                }
            )
        })
        .await;
        if let SessionEvent::Conversation {
            conversation,
            event: ConversationEvent::MembersJoined { members, .. },
        } = event
        {
            joined_order.push((conversation.id().to_string(), members[0].clone()));
        }
    }
    assert_eq!(
        joined_order,
        vec![
            ("a".to_string(), "m505".to_string()),
            ("a".to_string(), "m510".to_string()),
            ("a".to_string(), "m520".to_string()),
            ("b".to_string(), "m508".to_string()),
        ]
    );

    let a = session.cached_conversation("a").unwrap();
    assert_eq!(a.members().unwrap(), vec!["alice", "m505", "m510", "m520"]);

    let s = session.clone();
    wait_until(WAIT, "server mark at 520", move || {
        s.local_record().last_server_timestamp == Some(520)
    })
    .await;

    let fetches = bed.http.requests_to("/rtm/notifications");
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].param("start_ts"), Some("500"));
    assert_eq!(fetches[0].param("client_id"), Some("alice"));
    assert_eq!(fetches[0].header("X-LC-IM-Session-Token"), Some("token-1"));
}

/// Permanent and droppable events for one conversation interleave by
/// server timestamp, so the older droppable event is not lost behind a
/// newer permanent one.
#[tokio::test(start_paused = true)]
async fn test_mixed_sections_replay_in_server_order() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new();
    bed.gateway.respond_with(query_responder);
    bed.http.set_notifications(json!({
        "permanent": {"notifications": [
            joined("a", 520, "m520", "2021-01-03T00:00:00.000Z"),
        ]},
        "droppable": {"notifications": [
            joined("a", 505, "m505", "2021-01-01T12:00:00.000Z"),
        ]},
    }));

    let session = bed.session(&test_config("alice"), Some(store_with_mark(&dir, 500)));
    let mut events = session.events();
    session.open(OpenMode::Forced).await.unwrap();

    let mut joined_order = Vec::new();
    while joined_order.len() < 2 {
        let event = next_event(&mut events, WAIT, |e| {
            matches!(
                e,
                SessionEvent::Conversation {
                    event: ConversationEvent::MembersJoined { .. },
                    ..
                }
            )
        })
        .await;
        if let SessionEvent::Conversation {
            event: ConversationEvent::MembersJoined { members, .. },
            ..
        } = event
        {
            joined_order.push(members[0].clone());
        }
    }
    assert_eq!(joined_order, vec!["m505", "m520"]);

    let a = session.cached_conversation("a").unwrap();
    assert_eq!(a.members().unwrap(), vec!["alice", "m505", "m520"]);

    let s = session.clone();
    wait_until(WAIT, "server mark at 520", move || {
        s.local_record().last_server_timestamp == Some(520)
    })
    .await;
}

/// Without a persisted mark nothing is fetched.
#[tokio::test(start_paused = true)]
async fn test_no_mark_no_fetch() {
    let bed = TestBed::new();
    let session = bed.session(&test_config("alice"), None);
    session.open(OpenMode::Forced).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(bed.http.requests_to("/rtm/notifications").is_empty());
}

/// On resume, a feed flagged as invalidating the local cache marks every
/// cached conversation outdated instead of replaying droppable events.
/// Permanent events still apply.
#[tokio::test(start_paused = true)]
async fn test_resume_with_invalidated_cache_marks_outdated() {
    let dir = tempfile::tempdir().unwrap();
    let bed = TestBed::new();
    bed.gateway.respond_with(query_responder);
    let session = bed.session(&test_config("alice"), Some(store_with_mark(&dir, 500)));
    session.open(OpenMode::Forced).await.unwrap();

    let a = session.conversation("a").await.unwrap();
    assert!(!a.is_outdated());

    bed.http.set_notifications(json!({
        "permanent": {"notifications": [
            joined("a", 590, "kept", "2021-02-01T00:00:00.000Z"),
        ]},
        "droppable": {
            "invalidLocalConvCache": true,
            "notifications": [joined("a", 600, "dropped", "2021-02-01T00:00:00.000Z")],
        },
    }));
    let mut events = session.events();
    bed.gateway.drop_socket();
    next_event(&mut events, WAIT, |e| matches!(e, SessionEvent::DidResume)).await;

    let conversation = a.clone();
    wait_until(WAIT, "permanent event replayed", move || {
        conversation
            .members()
            .is_some_and(|m| m.contains(&"kept".to_string()))
    })
    .await;
    assert!(a.is_outdated());
    assert!(!a.members().unwrap().contains(&"dropped".to_string()));
    assert_eq!(bed.http.requests_to("/rtm/notifications").len(), 2);
}
