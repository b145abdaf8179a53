//! libSQL store: inbound message log (served back as conversation context)
//! and planner checkpoints.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::decision::context::ContextProvider;
use crate::decision::types::{Checkpoint, ConversationState, Message, Stage};
use crate::error::{ContextError, DatabaseError};
use crate::store::migrations;
use crate::store::traits::CheckpointStore;

/// libSQL-backed store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and store-less runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Record an inbound message. Returns `false` if the id was already stored.
    pub async fn record_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages
                    (id, channel_id, user_id, user_name, text, thread_id, sent_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.clone(),
                    message.channel_id.clone(),
                    message.user_id.clone(),
                    opt_text(message.user_name.as_deref()),
                    message.text.clone(),
                    opt_text(message.thread_id.as_deref()),
                    format_datetime(message.timestamp),
                    format_datetime(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_message: {e}")))?;

        debug!(message_id = %message.id, inserted = inserted > 0, "Message recorded");
        Ok(inserted > 0)
    }

    async fn recent_messages(
        &self,
        column: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1
                     ORDER BY sent_at DESC LIMIT ?2"
                ),
                params![value, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        messages.reverse();
        Ok(messages)
    }

    /// Number of stored checkpoints at `stage`.
    pub async fn count_checkpoints(&self, stage: Stage) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM checkpoints WHERE stage = ?1",
                params![stage.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_checkpoints: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_checkpoints: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, channel_id, user_id, user_name, text, thread_id, sent_at";

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let sent_at: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        user_id: row.get(2)?,
        user_name: row.get::<String>(3).ok(),
        text: row.get(4)?,
        thread_id: row.get::<String>(5).ok(),
        timestamp: parse_datetime(&sent_at),
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl ContextProvider for LibSqlStore {
    async fn channel_context(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ContextError> {
        Ok(self.recent_messages("channel_id", channel_id, limit).await?)
    }

    async fn principal_responses(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, ContextError> {
        Ok(self.recent_messages("user_id", user_id, limit).await?)
    }
}

#[async_trait]
impl CheckpointStore for LibSqlStore {
    async fn load(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT stage, state, updated_at FROM checkpoints WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("load_checkpoint: {e}"))),
        };

        let stage_str: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        let state_json: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        let updated_str: String = row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

        let stage = Stage::parse(&stage_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown stage '{stage_str}'"))
        })?;
        let state: ConversationState = serde_json::from_str(&state_json)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint state: {e}")))?;

        Ok(Some(Checkpoint {
            message_id: message_id.to_string(),
            stage,
            state,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let state_json = serde_json::to_string(&checkpoint.state)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint state: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO checkpoints (message_id, stage, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id) DO UPDATE SET
                    stage = excluded.stage,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.message_id.clone(),
                    checkpoint.stage.as_str(),
                    state_json,
                    format_datetime(checkpoint.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;

        debug!(
            message_id = %checkpoint.message_id,
            stage = %checkpoint.stage,
            "Checkpoint saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn msg_at(id: &str, channel: &str, user: &str, text: &str, minutes_ago: i64) -> Message {
        let mut m = Message::new(id, channel, user, text);
        m.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        m
    }

    // ── Messages ────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_ids_are_ignored() {
        let store = test_store().await;
        let m = msg_at("m1", "C1", "U1", "hello", 0);
        assert!(store.record_message(&m).await.unwrap());
        assert!(!store.record_message(&m).await.unwrap());
    }

    #[tokio::test]
    async fn channel_context_is_oldest_first_and_limited() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .record_message(&msg_at(&format!("m{i}"), "C1", "U1", "x", 10 - i))
                .await
                .unwrap();
        }
        store
            .record_message(&msg_at("other", "C2", "U1", "x", 0))
            .await
            .unwrap();

        let ctx = store.channel_context("C1", 3).await.unwrap();
        let ids: Vec<&str> = ctx.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn principal_responses_span_channels() {
        let store = test_store().await;
        store
            .record_message(&msg_at("a", "C1", "UP", "first", 2).with_thread("T1"))
            .await
            .unwrap();
        store
            .record_message(&msg_at("b", "C2", "UP", "second", 1).with_user_name("Pat"))
            .await
            .unwrap();
        store
            .record_message(&msg_at("c", "C1", "U9", "someone else", 0))
            .await
            .unwrap();

        let responses = store.principal_responses("UP", 20).await.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].thread_id.as_deref(), Some("T1"));
        assert_eq!(responses[1].user_name.as_deref(), Some("Pat"));
    }

    #[tokio::test]
    async fn empty_history_is_empty() {
        let store = test_store().await;
        assert!(store.channel_context("C1", 10).await.unwrap().is_empty());
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_upsert_and_load() {
        let store = test_store().await;
        let mut state = ConversationState::new(Message::new("m1", "C1", "U1", "hi"));
        state.stage = Stage::ContextGathered;
        store.save(&Checkpoint::of(&state)).await.unwrap();

        state.stage = Stage::End;
        state.reasoning = "done".into();
        store.save(&Checkpoint::of(&state)).await.unwrap();

        let loaded = store.load("m1").await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::End);
        assert_eq!(loaded.state.reasoning, "done");
        assert_eq!(loaded.state.message.text, "hi");
        assert_eq!(store.count_checkpoints(Stage::End).await.unwrap(), 1);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reply.db");

        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            let state = ConversationState::new(Message::new("m1", "C1", "U1", "hi"));
            store.save(&Checkpoint::of(&state)).await.unwrap();
        }

        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert!(store.load("m1").await.unwrap().is_some());
    }
}
