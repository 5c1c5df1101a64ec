//! Inbound command dispatch.
//!
//! Commands routed to this peer and offline reconciliation jobs are applied
//! strictly in arrival order by one task. Each command resolves its target
//! conversation (loading it if unknown), applies the matching operation and
//! publishes events. The server high-water mark advances after every
//! command that carries a server timestamp.

use rtm_protocol::{
    AckMessage, Command, CommandBody, ConvMessage, DirectMessage, OpType, PatchMessage,
    RcpMessage, UnreadMessage,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::conversation::{
    Conversation, ConversationKind, ExplicitUnread, MemberInfo, Operation, RawData,
};
use crate::lookup;
use crate::message::Message;
use crate::reconcile;
use crate::session::{ConversationEvent, PatchReason, SessionShared};

pub(crate) enum DispatchJob {
    Inbound(Command),
    Reconcile,
}

pub(crate) async fn run_dispatch_loop(
    shared: Arc<SessionShared>,
    mut rx: mpsc::UnboundedReceiver<DispatchJob>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            DispatchJob::Inbound(command) => dispatch(&shared, command).await,
            DispatchJob::Reconcile => reconcile::run(&shared).await,
        }
    }
    tracing::debug!(client = %shared.client_id, "session: dispatch task stopped");
}

/// Apply one inbound command.
pub(crate) async fn dispatch(shared: &SessionShared, command: Command) {
    let server_ts = command.server_ts;
    match (command.body, command.op) {
        (CommandBody::Conv(message), Some(op)) => on_conv(shared, op, message).await,
        (CommandBody::Direct(message), _) => on_direct(shared, message).await,
        (CommandBody::Rcp(receipt), _) => on_receipt(shared, receipt).await,
        (CommandBody::Unread(unread), _) => on_unread(shared, unread).await,
        (CommandBody::Patch(patch), Some(OpType::Modify)) => on_patch(shared, patch).await,
        (body, op) => {
            tracing::debug!(client = %shared.client_id, kind = body.kind().name(), ?op, "session: inbound command ignored");
        }
    }
    if let Some(ts) = server_ts {
        shared.advance_server_timestamp(ts);
    }
}

async fn target(shared: &SessionShared, cid: Option<&str>) -> Option<Arc<Conversation>> {
    let cid = cid?;
    match lookup::resolve(shared, cid).await {
        Ok(conversation) => Some(conversation),
        Err(e) => {
            tracing::warn!(client = %shared.client_id, conversation = %cid, "session: conversation unavailable: {e}");
            None
        }
    }
}

fn object(value: Option<Value>) -> RawData {
    match value {
        Some(Value::Object(map)) => map,
        _ => RawData::new(),
    }
}

async fn on_conv(shared: &SessionShared, op: OpType, message: ConvMessage) {
    let Some(conversation) = target(shared, message.cid.as_deref()).await else {
        return;
    };
    let by = message.init_by.clone();
    let me = vec![shared.client_id.clone()];
    let members = message.m;
    let udate = message.udate;

    let event = match op {
        OpType::Joined => {
            conversation.apply(Operation::Append { members: me, udate });
            ConversationEvent::Joined { by }
        }
        OpType::Left => {
            conversation.apply(Operation::Remove { members: me, udate });
            ConversationEvent::Left { by }
        }
        OpType::MembersJoined => {
            conversation.apply(Operation::Append {
                members: members.clone(),
                udate,
            });
            ConversationEvent::MembersJoined { members, by }
        }
        OpType::MembersLeft => {
            conversation.apply(Operation::Remove {
                members: members.clone(),
                udate,
            });
            ConversationEvent::MembersLeft { members, by }
        }
        OpType::MemberInfoChanged => {
            let Some(info) = message.info else {
                return;
            };
            let info = MemberInfo {
                member_id: info.pid,
                role: info.role,
            };
            conversation.apply(Operation::MemberInfoChanged(info.clone()));
            ConversationEvent::MemberInfoChanged { info, by }
        }
        OpType::Blocked => {
            conversation.apply(Operation::Remove { members: me, udate });
            ConversationEvent::Blocked { by }
        }
        OpType::Unblocked => ConversationEvent::Unblocked { by },
        OpType::MembersBlocked => {
            conversation.apply(Operation::Remove {
                members: members.clone(),
                udate,
            });
            ConversationEvent::MembersBlocked { members, by }
        }
        OpType::MembersUnblocked => ConversationEvent::MembersUnblocked { members, by },
        OpType::Shutuped => ConversationEvent::Muted { by },
        OpType::Unshutuped => ConversationEvent::Unmuted { by },
        OpType::MembersShutuped => ConversationEvent::MembersMuted { members, by },
        OpType::MembersUnshutuped => ConversationEvent::MembersUnmuted { members, by },
        OpType::Updated => {
            let attr = object(message.attr);
            let attr_modified = object(message.attr_modified);
            conversation.apply(Operation::Updated {
                attr: attr.clone(),
                attr_modified: attr_modified.clone(),
                udate,
            });
            ConversationEvent::DataUpdated {
                attr,
                attr_modified,
                by,
            }
        }
        other => {
            tracing::debug!(client = %shared.client_id, op = ?other, "session: conversation op ignored");
            return;
        }
    };
    shared.emit_conversation(&conversation, event);
}

async fn on_direct(shared: &SessionShared, direct: DirectMessage) {
    let Some(conversation) = target(shared, direct.cid.as_deref()).await else {
        return;
    };
    let message = Message::from_direct(&direct, &shared.client_id);

    let change = conversation.update_last_message(Some(&message), None);
    shared.emit_last_message_change(&conversation, change);

    if !message.transient && conversation.kind() != ConversationKind::Transient {
        if let Some(mid) = &message.id {
            shared.send(Command::new(CommandBody::Ack(AckMessage {
                cid: Some(conversation.id().to_string()),
                mid: Some(mid.clone()),
                ..Default::default()
            })));
        }
    }
    shared.emit_conversation(&conversation, ConversationEvent::MessageReceived(message));
}

async fn on_receipt(shared: &SessionShared, receipt: RcpMessage) {
    let Some(conversation) = target(shared, receipt.cid.as_deref()).await else {
        return;
    };
    let read = receipt.read.unwrap_or(false);
    if let Some(at) = receipt.t {
        if conversation.update_receipt(read, at) {
            let event = if read {
                ConversationEvent::LastReadAtUpdated
            } else {
                ConversationEvent::LastDeliveredAtUpdated
            };
            shared.emit_conversation(&conversation, event);
        }
    }
    let (message_id, by, at) = (receipt.id, receipt.from, receipt.t);
    let event = if read {
        ConversationEvent::MessageRead { message_id, by, at }
    } else {
        ConversationEvent::MessageDelivered { message_id, by, at }
    };
    shared.emit_conversation(&conversation, event);
}

async fn on_unread(shared: &SessionShared, unread: UnreadMessage) {
    let mut all_resolved = true;
    for tuple in &unread.convs {
        let Some(conversation) = target(shared, Some(&tuple.cid)).await else {
            all_resolved = false;
            continue;
        };
        let message = Message::from_unread(tuple, &shared.client_id);
        let explicit = ExplicitUnread {
            count: tuple.unread,
            mentioned: tuple.mentioned.unwrap_or(false),
        };
        let change = conversation.update_last_message(message.as_ref(), Some(explicit));
        shared.emit_last_message_change(&conversation, change);
    }
    if all_resolved {
        if let Some(notif_time) = unread.notif_time {
            shared.advance_unread_notif_time(notif_time);
        }
    }
}

async fn on_patch(shared: &SessionShared, patch: PatchMessage) {
    let mut all_resolved = true;
    let mut last_patch: Option<i64> = None;
    for item in &patch.patches {
        let Some(conversation) = target(shared, Some(&item.cid)).await else {
            all_resolved = false;
            continue;
        };
        let message = Message::from_patch(item, &shared.client_id);

        if conversation.is_last_message(&item.mid, item.timestamp) {
            let change = conversation.update_last_message(Some(&message), None);
            shared.emit_last_message_change(&conversation, change);
        }
        if let (Some(store), Some(row)) = (conversation.store(), message.to_row()) {
            if let Err(e) = store.update_message(&row) {
                tracing::warn!(conversation = %item.cid, "store: patched message not saved: {e}");
            }
        }
        if let Some(ts) = item.patch_timestamp {
            last_patch = Some(last_patch.map_or(ts, |current| current.max(ts)));
        }

        let reason = item.patch_code.map(|code| PatchReason {
            code,
            reason: item.patch_reason.clone(),
        });
        shared.emit_conversation(
            &conversation,
            ConversationEvent::MessageUpdated { message, reason },
        );
    }

    if all_resolved {
        if let Some(ts) = last_patch.or(patch.last_patch_time) {
            shared.advance_patch_timestamp(ts);
            let ack = PatchMessage {
                last_patch_time: Some(ts),
                ..Default::default()
            };
            shared.send(Command::new(CommandBody::Patch(ack)).with_op(OpType::Modified));
        }
    }
}
