//! RTM Storage -- rusqlite local store for one client.
//!
//! Conversations and last messages are replace-on-write, keyed by id.
//! Messages are keyed by (conversation_id, sent_timestamp, message_id) and
//! carry a `breakpoint` flag: true means contiguity with the next message in
//! the paging direction is not known. WAL mode + busy_timeout.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persisted status of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    Sent,
    Failed,
}

impl RowStatus {
    fn as_i64(self) -> i64 {
        match self {
            RowStatus::Sent => 3,
            RowStatus::Failed => 6,
        }
    }

    fn from_i64(v: i64) -> Self {
        if v == RowStatus::Failed.as_i64() {
            RowStatus::Failed
        } else {
            RowStatus::Sent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    /// Full attribute map as received from the backend.
    pub raw_data: serde_json::Value,
    /// Milliseconds; falls back to `created_timestamp` when never updated.
    pub updated_timestamp: i64,
    pub created_timestamp: i64,
    pub outdated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub conversation_id: String,
    /// Sent timestamp, or the sending timestamp for a failed row.
    pub sent_timestamp: i64,
    /// Server id, or the dedup token for a failed row.
    pub message_id: String,
    pub from_peer_id: Option<String>,
    pub content: Option<String>,
    pub binary: bool,
    pub delivered_timestamp: Option<i64>,
    pub read_timestamp: Option<i64>,
    pub patched_timestamp: Option<i64>,
    pub mentions_all: Option<bool>,
    pub mentioned_ids: Option<Vec<String>>,
    pub status: RowStatus,
    pub breakpoint: bool,
}

impl MessageRow {
    /// Newest-first ordering key: sent timestamp, then message id.
    pub fn cmp_position(&self, other: &MessageRow) -> Ordering {
        self.sent_timestamp
            .cmp(&other.sent_timestamp)
            .then_with(|| self.message_id.cmp(&other.message_id))
    }
}

/// A conversation with its cached last message.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub row: ConversationRow,
    pub last_message: Option<MessageRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationOrder {
    LastMessageSentTimestamp,
    UpdatedTimestamp,
    CreatedTimestamp,
}

impl ConversationOrder {
    fn column(&self) -> &'static str {
        match self {
            ConversationOrder::LastMessageSentTimestamp => "l.sent_timestamp",
            ConversationOrder::UpdatedTimestamp => "c.updated_timestamp",
            ConversationOrder::CreatedTimestamp => "c.created_timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryDirection {
    #[default]
    NewToOld,
    OldToNew,
}

impl QueryDirection {
    fn sql_order(&self) -> &'static str {
        match self {
            QueryDirection::NewToOld => "DESC",
            QueryDirection::OldToNew => "ASC",
        }
    }

    /// Wire value used by history requests.
    pub fn wire(&self) -> u8 {
        match self {
            QueryDirection::NewToOld => 1,
            QueryDirection::OldToNew => 2,
        }
    }
}

/// One end of a history range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEndpoint {
    pub sent_timestamp: i64,
    pub message_id: Option<String>,
    /// Inclusive when true.
    pub closed: bool,
}

impl MessageEndpoint {
    fn cmp_position(&self, other: &MessageEndpoint) -> Ordering {
        match self.sent_timestamp.cmp(&other.sent_timestamp) {
            Ordering::Equal => match (&self.message_id, &other.message_id) {
                (Some(a), Some(b)) => a.cmp(b),
                _ => Ordering::Equal,
            },
            ord => ord,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRange {
    pub conversation_id: String,
    pub start: Option<MessageEndpoint>,
    pub end: Option<MessageEndpoint>,
    pub direction: QueryDirection,
    pub limit: usize,
}

/// Result of a history range query, ascending by position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageRow>,
    /// Some returned row may not be contiguous with its neighbour.
    pub has_breakpoint: bool,
}

/// Per-peer high-water marks used to request only new offline events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub last_patch_timestamp: Option<i64>,
    pub last_server_timestamp: Option<i64>,
}

impl LocalRecord {
    /// Advance the server mark. Returns true if it moved.
    pub fn advance_server_timestamp(&mut self, ts: i64) -> bool {
        advance(&mut self.last_server_timestamp, ts)
    }

    /// Advance the patch mark. Returns true if it moved.
    pub fn advance_patch_timestamp(&mut self, ts: i64) -> bool {
        advance(&mut self.last_patch_timestamp, ts)
    }
}

fn advance(slot: &mut Option<i64>, ts: i64) -> bool {
    match slot {
        Some(current) if *current >= ts => false,
        _ => {
            *slot = Some(ts);
            true
        }
    }
}

/// Local store trait.
pub trait LocalStore: Send + Sync {
    fn upsert_conversation(&self, row: &ConversationRow) -> Result<()>;
    fn set_conversation_outdated(&self, id: &str, outdated: bool) -> Result<bool>;
    fn upsert_last_message(&self, conversation_id: &str, message: &MessageRow) -> Result<()>;
    fn list_conversations(&self, order: ConversationOrder) -> Result<Vec<StoredConversation>>;
    /// Remove conversations together with their last messages and history.
    fn delete_conversations(&self, ids: &[String]) -> Result<()>;

    /// Store a fetched page and resolve breakpoint flags at its extremes.
    /// Pages shorter than 3 are ignored.
    fn insert_message_page(&self, page: &[MessageRow]) -> Result<()>;
    fn insert_failed_message(&self, message: &MessageRow) -> Result<()>;
    fn delete_failed_message(
        &self,
        conversation_id: &str,
        sending_timestamp: i64,
        dedup_token: &str,
    ) -> Result<bool>;
    /// Patch content of an existing row in place.
    fn update_message(&self, message: &MessageRow) -> Result<bool>;
    fn select_messages(&self, range: &MessageRange) -> Result<MessagePage>;

    fn read_local_record(&self, peer_id: &str) -> Result<Option<LocalRecord>>;
    fn write_local_record(&self, peer_id: &str, record: &LocalRecord) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation (
    id TEXT PRIMARY KEY,
    raw_data TEXT NOT NULL,
    updated_timestamp INTEGER NOT NULL,
    created_timestamp INTEGER NOT NULL,
    outdated INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS conversation_updated_timestamp ON conversation(updated_timestamp);
CREATE INDEX IF NOT EXISTS conversation_created_timestamp ON conversation(created_timestamp);

CREATE TABLE IF NOT EXISTS last_message (
    conversation_id TEXT PRIMARY KEY,
    raw_data TEXT NOT NULL,
    sent_timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS last_message_sent_timestamp ON last_message(sent_timestamp);

CREATE TABLE IF NOT EXISTS message (
    conversation_id TEXT NOT NULL,
    sent_timestamp INTEGER NOT NULL,
    message_id TEXT NOT NULL,
    from_peer_id TEXT,
    content TEXT,
    binary INTEGER NOT NULL DEFAULT 0,
    delivered_timestamp INTEGER,
    read_timestamp INTEGER,
    patched_timestamp INTEGER,
    all_mentioned INTEGER,
    mentioned_list TEXT,
    status INTEGER NOT NULL,
    breakpoint INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conversation_id, sent_timestamp, message_id)
);

CREATE TABLE IF NOT EXISTS local_record (
    peer_id TEXT PRIMARY KEY,
    last_patch_timestamp INTEGER,
    last_server_timestamp INTEGER
);
";

const MESSAGE_COLUMNS: &str = "conversation_id, sent_timestamp, message_id, from_peer_id, content, \
     binary, delivered_timestamp, read_timestamp, patched_timestamp, all_mentioned, \
     mentioned_list, status, breakpoint";

/// SQLite-backed local store.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteLocalStore {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %db_path.display(), "store: opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

fn bind_message(row: &MessageRow) -> Result<Vec<rusqlite::types::Value>> {
    use rusqlite::types::Value as V;
    let opt_i = |v: Option<i64>| v.map(V::Integer).unwrap_or(V::Null);
    let opt_s = |v: &Option<String>| v.clone().map(V::Text).unwrap_or(V::Null);
    let mentioned = match &row.mentioned_ids {
        Some(ids) => V::Text(serde_json::to_string(ids)?),
        None => V::Null,
    };
    Ok(vec![
        V::Text(row.conversation_id.clone()),
        V::Integer(row.sent_timestamp),
        V::Text(row.message_id.clone()),
        opt_s(&row.from_peer_id),
        opt_s(&row.content),
        V::Integer(row.binary as i64),
        opt_i(row.delivered_timestamp),
        opt_i(row.read_timestamp),
        opt_i(row.patched_timestamp),
        row.mentions_all
            .map(|b| V::Integer(b as i64))
            .unwrap_or(V::Null),
        mentioned,
        V::Integer(row.status.as_i64()),
        V::Integer(row.breakpoint as i64),
    ])
}

fn read_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let mentioned: Option<String> = row.get(10)?;
    Ok(MessageRow {
        conversation_id: row.get(0)?,
        sent_timestamp: row.get(1)?,
        message_id: row.get(2)?,
        from_peer_id: row.get(3)?,
        content: row.get(4)?,
        binary: row.get(5)?,
        delivered_timestamp: row.get(6)?,
        read_timestamp: row.get(7)?,
        patched_timestamp: row.get(8)?,
        mentions_all: row.get(9)?,
        // A corrupt mention list degrades to none rather than failing the page.
        mentioned_ids: mentioned.and_then(|s| serde_json::from_str(&s).ok()),
        status: RowStatus::from_i64(row.get(11)?),
        breakpoint: row.get(12)?,
    })
}

fn upsert_message_sql() -> String {
    format!(
        "INSERT INTO message ({MESSAGE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(conversation_id, sent_timestamp, message_id) DO UPDATE SET
            from_peer_id = excluded.from_peer_id,
            content = excluded.content,
            binary = excluded.binary,
            delivered_timestamp = excluded.delivered_timestamp,
            read_timestamp = excluded.read_timestamp,
            patched_timestamp = excluded.patched_timestamp,
            all_mentioned = excluded.all_mentioned,
            mentioned_list = excluded.mentioned_list,
            status = excluded.status,
            breakpoint = excluded.breakpoint"
    )
}

/// Resolve the breakpoint flag of a page extreme.
///
/// Looks at up to two stored non-failed rows at or beyond `row` in the
/// extension direction. The first must be `row` itself (already stored);
/// if it is resolved the extreme stays resolved, otherwise the flag of the
/// next row beyond is inherited. Anything else is a true edge.
fn resolve_breakpoint(tx: &Transaction<'_>, row: &MessageRow, newest: bool) -> Result<bool> {
    let (cmp, order) = if newest { (">", "ASC") } else { ("<", "DESC") };
    let sql = format!(
        "SELECT sent_timestamp, message_id, breakpoint FROM message
         WHERE conversation_id = ?1
           AND ((sent_timestamp = ?2 AND message_id {cmp}= ?3) OR sent_timestamp {cmp} ?2)
           AND status != ?4
         ORDER BY sent_timestamp {order}, message_id {order}
         LIMIT 2"
    );
    let mut stmt = tx.prepare(&sql)?;
    let neighbours = stmt
        .query_map(
            params![
                row.conversation_id,
                row.sent_timestamp,
                row.message_id,
                RowStatus::Failed.as_i64()
            ],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, bool>(2)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut breakpoint = true;
    for (index, (ts, id, flag)) in neighbours.into_iter().enumerate() {
        if index == 0 {
            if ts != row.sent_timestamp || id != row.message_id {
                break;
            }
            if !flag {
                breakpoint = false;
                break;
            }
        } else {
            breakpoint = flag;
        }
    }
    Ok(breakpoint)
}

/// Where-clause for a range, with its bound values.
fn range_condition(range: &MessageRange) -> (String, Vec<rusqlite::types::Value>) {
    use rusqlite::types::Value as V;

    let (newest, oldest) = match (&range.start, &range.end) {
        (Some(start), Some(end)) => {
            if start.cmp_position(end) == Ordering::Less {
                (Some(end), Some(start))
            } else {
                (Some(start), Some(end))
            }
        }
        (Some(start), None) => match range.direction {
            QueryDirection::NewToOld => (Some(start), None),
            QueryDirection::OldToNew => (None, Some(start)),
        },
        (None, Some(end)) => match range.direction {
            QueryDirection::NewToOld => (None, Some(end)),
            QueryDirection::OldToNew => (Some(end), None),
        },
        (None, None) => (None, None),
    };

    let mut values: Vec<V> = Vec::new();
    let mut bound = |endpoint: &MessageEndpoint, upper: bool| -> String {
        let strict = if upper { "<" } else { ">" };
        let cmp = if endpoint.closed {
            if upper {
                "<="
            } else {
                ">="
            }
        } else {
            strict
        };
        match &endpoint.message_id {
            Some(id) => {
                values.push(V::Integer(endpoint.sent_timestamp));
                values.push(V::Text(id.clone()));
                values.push(V::Integer(endpoint.sent_timestamp));
                format!("(sent_timestamp = ? AND message_id {cmp} ?) OR sent_timestamp {strict} ?")
            }
            None => {
                values.push(V::Integer(endpoint.sent_timestamp));
                format!("sent_timestamp {cmp} ?")
            }
        }
    };

    let condition = match (newest, oldest) {
        (Some(n), Some(o)) => {
            let upper = bound(n, true);
            let lower = bound(o, false);
            format!("({upper}) AND ({lower})")
        }
        (Some(n), None) => bound(n, true),
        (None, Some(o)) => bound(o, false),
        (None, None) => "1 = 1".to_string(),
    };
    (condition, values)
}

impl LocalStore for SqliteLocalStore {
    fn upsert_conversation(&self, row: &ConversationRow) -> Result<()> {
        let raw = serde_json::to_string(&row.raw_data)?;
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO conversation (id, raw_data, updated_timestamp, created_timestamp, outdated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                raw_data = excluded.raw_data,
                updated_timestamp = excluded.updated_timestamp,
                created_timestamp = excluded.created_timestamp,
                outdated = excluded.outdated",
            params![
                row.id,
                raw,
                row.updated_timestamp,
                row.created_timestamp,
                row.outdated
            ],
        )?;
        Ok(())
    }

    fn set_conversation_outdated(&self, id: &str, outdated: bool) -> Result<bool> {
        let conn = self.db()?;
        let changed = conn.execute(
            "UPDATE conversation SET outdated = ?1 WHERE id = ?2",
            params![outdated, id],
        )?;
        Ok(changed > 0)
    }

    fn upsert_last_message(&self, conversation_id: &str, message: &MessageRow) -> Result<()> {
        if message.status != RowStatus::Sent {
            return Err(StorageError::InvalidRow(
                "last message must be sent".into(),
            ));
        }
        let raw = serde_json::to_string(message)?;
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO last_message (conversation_id, raw_data, sent_timestamp)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO UPDATE SET
                raw_data = excluded.raw_data,
                sent_timestamp = excluded.sent_timestamp",
            params![conversation_id, raw, message.sent_timestamp],
        )?;
        Ok(())
    }

    fn list_conversations(&self, order: ConversationOrder) -> Result<Vec<StoredConversation>> {
        let conn = self.db()?;
        let sql = format!(
            "SELECT c.id, c.raw_data, c.updated_timestamp, c.created_timestamp, c.outdated, l.raw_data
             FROM conversation c
             LEFT JOIN last_message l ON l.conversation_id = c.id
             ORDER BY {} DESC",
            order.column()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, raw, updated, created, outdated, last) in rows {
            let raw_data = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(conversation = %id, "store: skipping unreadable conversation: {e}");
                    continue;
                }
            };
            let last_message = last.and_then(|s| serde_json::from_str::<MessageRow>(&s).ok());
            out.push(StoredConversation {
                row: ConversationRow {
                    id,
                    raw_data,
                    updated_timestamp: updated,
                    created_timestamp: created,
                    outdated,
                },
                last_message,
            });
        }
        Ok(out)
    }

    fn delete_conversations(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("DELETE FROM conversation WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM last_message WHERE conversation_id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )?;
        tx.execute(
            &format!("DELETE FROM message WHERE conversation_id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn insert_message_page(&self, page: &[MessageRow]) -> Result<()> {
        if page.len() < 3 {
            return Ok(());
        }
        if let Some(bad) = page.iter().find(|m| m.status != RowStatus::Sent) {
            return Err(StorageError::InvalidRow(format!(
                "page message {} is not sent",
                bad.message_id
            )));
        }
        let (newest, oldest) = {
            let mut newest = &page[0];
            let mut oldest = &page[0];
            for m in &page[1..] {
                if m.cmp_position(newest) == Ordering::Greater {
                    newest = m;
                }
                if m.cmp_position(oldest) == Ordering::Less {
                    oldest = m;
                }
            }
            (newest.clone(), oldest.clone())
        };

        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        let newest_flag = resolve_breakpoint(&tx, &newest, true)?;
        let oldest_flag = resolve_breakpoint(&tx, &oldest, false)?;
        {
            let mut stmt = tx.prepare(&upsert_message_sql())?;
            for m in page {
                let mut row = m.clone();
                row.breakpoint = if row.cmp_position(&newest) == Ordering::Equal {
                    newest_flag
                } else if row.cmp_position(&oldest) == Ordering::Equal {
                    oldest_flag
                } else {
                    false
                };
                stmt.execute(params_from_iter(bind_message(&row)?))?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            conversation = %newest.conversation_id,
            count = page.len(),
            newest_breakpoint = newest_flag,
            oldest_breakpoint = oldest_flag,
            "store: page inserted"
        );
        Ok(())
    }

    fn insert_failed_message(&self, message: &MessageRow) -> Result<()> {
        if message.status != RowStatus::Failed {
            return Err(StorageError::InvalidRow(
                "failed-message row must have failed status".into(),
            ));
        }
        let mut row = message.clone();
        row.breakpoint = false;
        let conn = self.db()?;
        conn.execute(&upsert_message_sql(), params_from_iter(bind_message(&row)?))?;
        Ok(())
    }

    fn delete_failed_message(
        &self,
        conversation_id: &str,
        sending_timestamp: i64,
        dedup_token: &str,
    ) -> Result<bool> {
        let conn = self.db()?;
        let deleted = conn.execute(
            "DELETE FROM message
             WHERE conversation_id = ?1 AND sent_timestamp = ?2 AND message_id = ?3 AND status = ?4",
            params![
                conversation_id,
                sending_timestamp,
                dedup_token,
                RowStatus::Failed.as_i64()
            ],
        )?;
        Ok(deleted > 0)
    }

    fn update_message(&self, message: &MessageRow) -> Result<bool> {
        let mentioned = match &message.mentioned_ids {
            Some(ids) => Some(serde_json::to_string(ids)?),
            None => None,
        };
        let conn = self.db()?;
        let changed = conn.execute(
            "UPDATE message SET
                from_peer_id = ?1, content = ?2, binary = ?3, patched_timestamp = ?4,
                all_mentioned = ?5, mentioned_list = ?6
             WHERE conversation_id = ?7 AND sent_timestamp = ?8 AND message_id = ?9",
            params![
                message.from_peer_id,
                message.content,
                message.binary,
                message.patched_timestamp,
                message.mentions_all,
                mentioned,
                message.conversation_id,
                message.sent_timestamp,
                message.message_id
            ],
        )?;
        Ok(changed > 0)
    }

    fn select_messages(&self, range: &MessageRange) -> Result<MessagePage> {
        let (condition, mut values) = range_condition(range);
        let order = range.direction.sql_order();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM message
             WHERE conversation_id = ? AND ({condition})
             ORDER BY sent_timestamp {order}, message_id {order}
             LIMIT ?"
        );
        values.insert(0, rusqlite::types::Value::Text(range.conversation_id.clone()));
        values.push(rusqlite::types::Value::Integer(range.limit as i64));

        let conn = self.db()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut messages = stmt
            .query_map(params_from_iter(values), read_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if range.direction == QueryDirection::NewToOld {
            messages.reverse();
        }
        let has_breakpoint = messages.iter().any(|m| m.breakpoint);
        Ok(MessagePage {
            messages,
            has_breakpoint,
        })
    }

    fn read_local_record(&self, peer_id: &str) -> Result<Option<LocalRecord>> {
        let conn = self.db()?;
        let record = conn
            .query_row(
                "SELECT last_patch_timestamp, last_server_timestamp FROM local_record WHERE peer_id = ?1",
                params![peer_id],
                |row| {
                    Ok(LocalRecord {
                        last_patch_timestamp: row.get(0)?,
                        last_server_timestamp: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn write_local_record(&self, peer_id: &str, record: &LocalRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO local_record (peer_id, last_patch_timestamp, last_server_timestamp)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(peer_id) DO UPDATE SET
                last_patch_timestamp = excluded.last_patch_timestamp,
                last_server_timestamp = excluded.last_server_timestamp",
            params![
                peer_id,
                record.last_patch_timestamp,
                record.last_server_timestamp
            ],
        )?;
        Ok(())
    }
}
