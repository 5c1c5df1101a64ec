//! Per-session conversation cache with coalesced backend lookups.
//!
//! Each conversation id maps to exactly one `Arc<Conversation>` for the
//! session's lifetime. Concurrent lookups for the same unknown id share a
//! single query; late callers wait on a oneshot for the leader's result.

use rtm_protocol::{Command, CommandBody, ConvMessage, OpType, DEFAULT_PARAMS};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::conversation::{Conversation, Operation, RawData, TEMPORARY_ID_PREFIX};
use crate::error::{Result, RtmError};
use crate::session::SessionShared;

type Waiter = oneshot::Sender<Result<Arc<Conversation>>>;

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Arc<Conversation>>,
    lookups: HashMap<String, Vec<Waiter>>,
}

#[derive(Default)]
pub(crate) struct ConversationCache {
    inner: Mutex<Inner>,
}

enum Slot {
    Ready(Arc<Conversation>),
    Wait(oneshot::Receiver<Result<Arc<Conversation>>>),
    Lead,
}

impl ConversationCache {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.lock().conversations.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Conversation>> {
        self.lock().conversations.values().cloned().collect()
    }

    /// Drop the given ids, or everything when `ids` is `None`.
    pub fn evict(&self, ids: Option<&[String]>) {
        let mut inner = self.lock();
        match ids {
            Some(ids) => {
                for id in ids {
                    inner.conversations.remove(id);
                }
            }
            None => inner.conversations.clear(),
        }
    }

    /// Keep `conversation` unless an instance for its id already exists.
    pub fn adopt(&self, conversation: Arc<Conversation>) -> Arc<Conversation> {
        self.lock()
            .conversations
            .entry(conversation.id().to_string())
            .or_insert(conversation)
            .clone()
    }

    /// Apply fresh server data: replaces the existing instance's data or
    /// creates and saves a new one.
    pub fn upsert(
        &self,
        shared: &SessionShared,
        id: &str,
        raw: RawData,
        op: fn(RawData) -> Operation,
    ) -> Arc<Conversation> {
        if let Some(existing) = self.get(id) {
            existing.apply(op(raw));
            return existing;
        }
        let created = Conversation::new(id, shared.client_id.clone(), raw, shared.store.clone());
        let adopted = self.adopt(created.clone());
        if Arc::ptr_eq(&adopted, &created) {
            created.save();
        }
        adopted
    }
}

/// The conversation for `id`, querying the backend at most once for any
/// number of concurrent callers.
pub(crate) async fn resolve(shared: &SessionShared, id: &str) -> Result<Arc<Conversation>> {
    let slot = {
        let mut inner = shared.conversations.lock();
        if let Some(conversation) = inner.conversations.get(id) {
            Slot::Ready(conversation.clone())
        } else if let Some(waiters) = inner.lookups.get_mut(id) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            Slot::Wait(rx)
        } else {
            inner.lookups.insert(id.to_string(), Vec::new());
            Slot::Lead
        }
    };

    match slot {
        Slot::Ready(conversation) => Ok(conversation),
        Slot::Wait(rx) => rx.await.unwrap_or(Err(RtmError::ConversationNotFound)),
        Slot::Lead => {
            let result = query(shared, &[id.to_string()]).await.and_then(|found| {
                found
                    .into_iter()
                    .find(|c| c.id() == id)
                    .ok_or(RtmError::ConversationNotFound)
            });
            let waiters = shared
                .conversations
                .lock()
                .lookups
                .remove(id)
                .unwrap_or_default();
            if !waiters.is_empty() {
                tracing::debug!(conversation = %id, waiters = waiters.len(), "session: coalesced lookup");
            }
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            result
        }
    }
}

/// Query conversations by id in batches, temporary ids through their own
/// endpoint. Results land in the session cache.
pub(crate) async fn query(shared: &SessionShared, ids: &[String]) -> Result<Vec<Arc<Conversation>>> {
    let (temporary, normal): (Vec<String>, Vec<String>) = ids
        .iter()
        .cloned()
        .partition(|id| id.starts_with(TEMPORARY_ID_PREFIX));

    let mut found = Vec::with_capacity(ids.len());
    for chunk in normal.chunks(DEFAULT_PARAMS.conversation_query_batch) {
        let message = ConvMessage {
            where_clause: Some(serde_json::json!({ "objectId": { "$in": chunk } })),
            limit: Some(chunk.len() as u32),
            ..Default::default()
        };
        found.extend(query_batch(shared, message).await?);
    }
    for chunk in temporary.chunks(DEFAULT_PARAMS.conversation_query_batch) {
        let message = ConvMessage {
            temp_conv_ids: chunk.to_vec(),
            limit: Some(chunk.len() as u32),
            ..Default::default()
        };
        found.extend(query_batch(shared, message).await?);
    }
    Ok(found)
}

async fn query_batch(shared: &SessionShared, message: ConvMessage) -> Result<Vec<Arc<Conversation>>> {
    let command = Command::new(CommandBody::Conv(message)).with_op(OpType::Query);
    let reply = shared.request(command).await?;
    let CommandBody::Conv(result) = reply.body else {
        return Err(RtmError::CommandInvalid("conversation query reply".into()));
    };
    let objects = decode_results(result.results)?;

    let mut conversations = Vec::with_capacity(objects.len());
    for object in objects {
        let Some(id) = object.get("objectId").and_then(Value::as_str).map(str::to_string) else {
            tracing::debug!("session: query result without objectId skipped");
            continue;
        };
        conversations.push(shared.conversations.upsert(
            shared,
            &id,
            object,
            Operation::RawDataReplace,
        ));
    }
    Ok(conversations)
}

/// Query results arrive either as a JSON array or as a string holding one.
fn decode_results(results: Option<Value>) -> Result<Vec<RawData>> {
    let value = match results {
        None => return Ok(Vec::new()),
        Some(Value::String(text)) => serde_json::from_str(&text)?,
        Some(value) => value,
    };
    let Value::Array(items) = value else {
        return Err(RtmError::MalformedData("conversation results not an array".into()));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(object) => Some(object),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_results_accepts_string_or_array() {
        let array = decode_results(Some(json!([{"objectId": "a"}, 3]))).unwrap();
        assert_eq!(array.len(), 1);
        let text = decode_results(Some(json!("[{\"objectId\":\"b\"}]"))).unwrap();
        assert_eq!(text[0]["objectId"], "b");
        assert!(decode_results(None).unwrap().is_empty());
        assert!(matches!(
            decode_results(Some(json!({"objectId": "a"}))),
            Err(RtmError::MalformedData(_))
        ));
    }

    #[test]
    fn test_adopt_keeps_first_instance() {
        let cache = ConversationCache::default();
        let first = Conversation::new("c1", "alice", RawData::new(), None);
        let second = Conversation::new("c1", "alice", RawData::new(), None);
        assert!(Arc::ptr_eq(&cache.adopt(first.clone()), &first));
        assert!(Arc::ptr_eq(&cache.adopt(second), &first));

        cache.evict(Some(&["c1".to_string()]));
        assert!(cache.get("c1").is_none());
    }
}
