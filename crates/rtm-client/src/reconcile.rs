//! Offline reconciliation -- replay of events missed while disconnected.
//!
//! After an open succeeds with a known server high-water mark, the session
//! fetches the notification feed recorded since that mark. Permanent events
//! always replay. Droppable events replay too unless the feed instead says
//! the whole local cache is stale, in which case every cached conversation
//! is marked outdated. Events are grouped per conversation and replayed in
//! ascending server timestamp; conversations not yet cached are queried in
//! batches first.

use rtm_protocol::{Command, CommandBody, ConvMessage, MemberInfo, OpType, RcpMessage};
use serde_json::Value;
use std::collections::HashMap;

use crate::conversation::TEMPORARY_ID_PREFIX;
use crate::dispatch;
use crate::error::{Result, RtmError};
use crate::http::api_url;
use crate::lookup;
use crate::session::SessionShared;

const SESSION_TOKEN_HEADER: &str = "X-LC-IM-Session-Token";

/// One feed entry, already shaped as the command it replays as.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub conversation_id: String,
    pub server_ts: i64,
    pub command: Command,
}

impl Notification {
    /// Parse a feed entry. Entries without `cid` or `serverTs`, or with an
    /// unknown `cmd`/`op`, are skipped.
    pub fn parse(value: &Value) -> Option<Self> {
        let str_field = |k: &str| value.get(k).and_then(Value::as_str).map(str::to_string);
        let cid = str_field("cid")?;
        let server_ts = value.get("serverTs").and_then(Value::as_i64)?;

        let (body, op) = match value.get("cmd").and_then(Value::as_str)? {
            "conv" => {
                let op = OpType::from_feed(value.get("op").and_then(Value::as_str)?)?;
                let members = value
                    .get("m")
                    .and_then(Value::as_array)
                    .map(|m| {
                        m.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let info = value.get("info").and_then(|info| {
                    Some(MemberInfo {
                        pid: info.get("pid")?.as_str()?.to_string(),
                        role: info.get("role").and_then(Value::as_str).map(str::to_string),
                    })
                });
                let message = ConvMessage {
                    cid: Some(cid.clone()),
                    m: members,
                    init_by: str_field("initBy"),
                    attr: value.get("attr").cloned(),
                    attr_modified: value.get("attrModified").cloned(),
                    udate: str_field("udate"),
                    info,
                    ..Default::default()
                };
                (CommandBody::Conv(message), Some(op))
            }
            "rcp" => {
                let receipt = RcpMessage {
                    cid: Some(cid.clone()),
                    id: str_field("id"),
                    t: value.get("t").and_then(Value::as_i64),
                    read: value.get("read").and_then(Value::as_bool),
                    from: str_field("from"),
                };
                (CommandBody::Rcp(receipt), None)
            }
            _ => return None,
        };

        let mut command = Command::new(body);
        command.op = op;
        command.server_ts = Some(server_ts);
        Some(Self {
            conversation_id: cid,
            server_ts,
            command,
        })
    }
}

/// Parsed `/rtm/notifications` reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationFeed {
    pub permanent: Vec<Notification>,
    pub droppable: Vec<Notification>,
    /// Droppable events were discarded server-side; local cache is stale.
    pub invalidate_local_cache: bool,
}

fn parse_list(section: Option<&Value>) -> Vec<Notification> {
    section
        .and_then(|s| s.get("notifications"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Notification::parse).collect())
        .unwrap_or_default()
}

impl NotificationFeed {
    pub fn from_json(value: &Value) -> Self {
        let droppable = value.get("droppable");
        Self {
            permanent: parse_list(value.get("permanent")),
            droppable: parse_list(droppable),
            invalidate_local_cache: droppable
                .and_then(|d| d.get("invalidLocalConvCache"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// Replay groups across both sections. Droppable events are left out
    /// when the feed invalidates the local cache.
    pub fn into_groups(self) -> Vec<(String, Vec<Notification>)> {
        let mut events = self.permanent;
        if !self.invalidate_local_cache {
            events.extend(self.droppable);
        }
        group_by_conversation(events)
    }
}

/// Group notifications by conversation, in order of first appearance, each
/// group sorted ascending by server timestamp. The sort is stable, so events
/// sharing a timestamp keep feed order.
pub fn group_by_conversation(items: Vec<Notification>) -> Vec<(String, Vec<Notification>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Notification>)> = Vec::new();
    for item in items {
        match index.get(&item.conversation_id) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(item.conversation_id.clone(), groups.len());
                groups.push((item.conversation_id.clone(), vec![item]));
            }
        }
    }
    for (_, group) in &mut groups {
        group.sort_by_key(|n| n.server_ts);
    }
    groups
}

async fn fetch(shared: &SessionShared, start_ts: i64) -> Result<NotificationFeed> {
    let token = shared.valid_token().ok_or(RtmError::ClientNotOpen)?;
    let url = api_url(&shared.api_server, "/rtm/notifications");
    let query = [
        ("client_id", shared.client_id.clone()),
        ("start_ts", start_ts.to_string()),
    ];
    let headers = [(SESSION_TOKEN_HEADER, token)];
    let reply = shared.http.get_json(&url, &query, &headers).await?;
    Ok(NotificationFeed::from_json(&reply))
}

/// Fetch and replay offline events since the persisted server mark.
pub(crate) async fn run(shared: &SessionShared) {
    let Some(start_ts) = shared.local_record().last_server_timestamp else {
        return;
    };
    let feed = match fetch(shared, start_ts).await {
        Ok(feed) => feed,
        Err(e) => {
            tracing::warn!(client = %shared.client_id, start_ts, "session: offline fetch failed: {e}");
            return;
        }
    };
    tracing::info!(
        client = %shared.client_id,
        start_ts,
        permanent = feed.permanent.len(),
        droppable = feed.droppable.len(),
        invalidate = feed.invalidate_local_cache,
        "session: offline notifications fetched"
    );

    if feed.invalidate_local_cache {
        for conversation in shared.conversations.all() {
            conversation.set_outdated(true);
        }
    }
    replay(shared, feed.into_groups()).await;
}

async fn replay(shared: &SessionShared, groups: Vec<(String, Vec<Notification>)>) {
    let (known, unknown): (Vec<_>, Vec<_>) = groups
        .into_iter()
        .partition(|(cid, _)| shared.conversations.get(cid).is_some());

    for (_, group) in known {
        replay_group(shared, group).await;
    }
    if unknown.is_empty() {
        return;
    }

    let ids: Vec<String> = unknown.iter().map(|(cid, _)| cid.clone()).collect();
    let temporary = ids.iter().filter(|id| id.starts_with(TEMPORARY_ID_PREFIX)).count();
    tracing::debug!(
        client = %shared.client_id,
        normal = ids.len() - temporary,
        temporary,
        "session: querying conversations for offline replay"
    );
    if let Err(e) = lookup::query(shared, &ids).await {
        tracing::warn!(client = %shared.client_id, "session: offline conversation query failed: {e}");
        return;
    }
    for (cid, group) in unknown {
        if shared.conversations.get(&cid).is_some() {
            replay_group(shared, group).await;
        } else {
            tracing::debug!(conversation = %cid, "session: offline events dropped, conversation not found");
        }
    }
}

async fn replay_group(shared: &SessionShared, group: Vec<Notification>) {
    for notification in group {
        dispatch::dispatch(shared, notification.command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conv(cid: &str, ts: i64) -> Value {
        json!({"cmd": "conv", "op": "members-joined", "cid": cid, "serverTs": ts, "m": ["x"], "udate": "2020-01-01T00:00:00.000Z"})
    }

    #[test]
    fn test_parse_conv_and_rcp() {
        let n = Notification::parse(&json!({
            "cmd": "conv", "op": "member-info-changed", "cid": "c1", "serverTs": 7,
            "initBy": "bob", "info": {"pid": "carol", "role": "Manager"},
        }))
        .unwrap();
        assert_eq!(n.command.op, Some(OpType::MemberInfoChanged));
        assert_eq!(n.command.server_ts, Some(7));
        let CommandBody::Conv(message) = &n.command.body else {
            panic!("expected conv body");
        };
        assert_eq!(message.init_by.as_deref(), Some("bob"));
        assert_eq!(message.info.as_ref().unwrap().pid, "carol");

        let r = Notification::parse(&json!({
            "cmd": "rcp", "cid": "c1", "serverTs": 8, "id": "m1", "t": 99, "read": true, "from": "bob",
        }))
        .unwrap();
        assert!(matches!(r.command.body, CommandBody::Rcp(RcpMessage { read: Some(true), .. })));
    }

    #[test]
    fn test_parse_skips_incomplete() {
        assert!(Notification::parse(&json!({"cmd": "conv", "op": "joined", "serverTs": 1})).is_none());
        assert!(Notification::parse(&json!({"cmd": "conv", "op": "joined", "cid": "c"})).is_none());
        assert!(Notification::parse(&json!({"cmd": "conv", "op": "bogus", "cid": "c", "serverTs": 1})).is_none());
        assert!(Notification::parse(&json!({"cmd": "other", "cid": "c", "serverTs": 1})).is_none());
    }

    #[test]
    fn test_feed_sections() {
        let feed = NotificationFeed::from_json(&json!({
            "permanent": {"notifications": [conv("a", 1)]},
            "droppable": {"invalidLocalConvCache": true},
        }));
        assert_eq!(feed.permanent.len(), 1);
        assert!(feed.droppable.is_empty());
        assert!(feed.invalidate_local_cache);
    }

    #[test]
    fn test_grouping_sorts_per_conversation() {
        let items = [conv("a", 510), conv("b", 508), conv("a", 505), conv("a", 520)]
            .iter()
            .filter_map(Notification::parse)
            .collect();
        let groups = group_by_conversation(items);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        let order: Vec<i64> = groups[0].1.iter().map(|n| n.server_ts).collect();
        assert_eq!(order, vec![505, 510, 520]);
        assert_eq!(groups[1].1[0].server_ts, 508);
    }

    #[test]
    fn test_sections_merge_before_ordering() {
        let feed = NotificationFeed::from_json(&json!({
            "permanent": {"notifications": [conv("a", 520), conv("b", 400)]},
            "droppable": {"notifications": [conv("a", 505), conv("b", 390)]},
        }));
        let groups = feed.into_groups();
        let order: Vec<(String, Vec<i64>)> = groups
            .iter()
            .map(|(cid, group)| (cid.clone(), group.iter().map(|n| n.server_ts).collect()))
            .collect();
        assert_eq!(
            order,
            vec![("a".to_string(), vec![505, 520]), ("b".to_string(), vec![390, 400])]
        );
    }

    #[test]
    fn test_invalidated_feed_keeps_only_permanent() {
        let feed = NotificationFeed::from_json(&json!({
            "permanent": {"notifications": [conv("a", 520)]},
            "droppable": {"invalidLocalConvCache": true, "notifications": [conv("a", 505)]},
        }));
        let groups = feed.into_groups();
        assert_eq!(groups.len(), 1);
        let order: Vec<i64> = groups[0].1.iter().map(|n| n.server_ts).collect();
        assert_eq!(order, vec![520]);
    }

    #[test]
    fn test_grouping_is_stable_for_equal_timestamps() {
        let first = json!({"cmd": "rcp", "cid": "a", "serverTs": 5, "id": "first"});
        let second = json!({"cmd": "rcp", "cid": "a", "serverTs": 5, "id": "second"});
        let items = [second.clone(), first.clone()]
            .iter()
            .filter_map(Notification::parse)
            .collect();
        let groups = group_by_conversation(items);
        let ids: Vec<_> = groups[0]
            .1
            .iter()
            .map(|n| match &n.command.body {
                CommandBody::Rcp(r) => r.id.clone().unwrap(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["second", "first"]);
    }
}
