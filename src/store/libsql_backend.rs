//! libSQL repository: durable `MessageRepository` + `CursorStore`.
//!
//! Supports local file and in-memory databases. Batches are written inside a
//! transaction; dropping an unfinished transaction rolls it back.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ingest::model::{Direction, IngestedMessage, MailboxCursor, UpsertOutcome};
use crate::store::migrations;
use crate::store::traits::{
    CursorStore, MessageRepository, cancellable, merge_upsert, validate_message,
};

/// libSQL-backed store.
///
/// Stores a single connection that is reused for all operations; writes that
/// span several statements are serialized.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
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

    /// Create an in-memory database (for tests).
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
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, protocol_message_id, thread_id, direction, mailbox, uid, envelope, body_text, body_html, attachments, processed, related_entity_id, created_at, updated_at";

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

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Constraint failures are reported distinctly from other query errors.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("constraint") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row to an IngestedMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<IngestedMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
    let ser_err = |e: String| DatabaseError::Serialization(e);

    let id: String = row.get(0).map_err(get_err)?;
    let direction: String = row.get(3).map_err(get_err)?;
    let uid: i64 = row.get(5).map_err(get_err)?;
    let envelope: String = row.get(6).map_err(get_err)?;
    let attachments: String = row.get(9).map_err(get_err)?;
    let processed: i64 = row.get(10).map_err(get_err)?;
    let created: String = row.get(12).map_err(get_err)?;
    let updated: String = row.get(13).map_err(get_err)?;

    Ok(IngestedMessage {
        id: Uuid::parse_str(&id).map_err(|e| ser_err(format!("id '{id}': {e}")))?,
        protocol_message_id: row.get(1).map_err(get_err)?,
        thread_id: row.get(2).ok(),
        direction: direction.parse::<Direction>().map_err(ser_err)?,
        mailbox: row.get(4).map_err(get_err)?,
        uid: uid.max(0) as u64,
        envelope: serde_json::from_str(&envelope).map_err(|e| ser_err(format!("envelope: {e}")))?,
        body_text: row.get(7).ok(),
        body_html: row.get(8).ok(),
        attachments: serde_json::from_str(&attachments)
            .map_err(|e| ser_err(format!("attachments: {e}")))?,
        processed: processed != 0,
        related_entity_id: row.get(11).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

async fn collect_messages(mut rows: libsql::Rows, op: &str) -> Result<Vec<IngestedMessage>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => out.push(row_to_message(&row)?),
            Ok(None) => return Ok(out),
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

async fn select_by_protocol_id(
    conn: &Connection,
    protocol_message_id: &str,
) -> Result<Option<IngestedMessage>, DatabaseError> {
    let rows = conn
        .query(
            &format!("SELECT {MESSAGE_COLUMNS} FROM ingested_messages WHERE protocol_message_id = ?1"),
            params![protocol_message_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_by_protocol_message_id: {e}")))?;
    Ok(collect_messages(rows, "find_by_protocol_message_id")
        .await?
        .into_iter()
        .next())
}

/// Insert or update one message on `conn` (a plain connection or a transaction).
async fn upsert_on(conn: &Connection, message: &IngestedMessage) -> Result<UpsertOutcome, DatabaseError> {
    let existing = select_by_protocol_id(conn, &message.protocol_message_id).await?;

    let (record, outcome) = match existing {
        None => (message.clone(), UpsertOutcome::Inserted),
        Some(existing) => match merge_upsert(&existing, message) {
            None => return Ok(UpsertOutcome::Unchanged),
            Some(merged) => (merged, UpsertOutcome::Updated),
        },
    };

    let envelope = to_json(&record.envelope)?;
    let attachments = to_json(&record.attachments)?;

    match outcome {
        UpsertOutcome::Inserted => {
            conn.execute(
                &format!(
                    "INSERT INTO ingested_messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.to_string(),
                    record.protocol_message_id.clone(),
                    opt_text(record.thread_id.as_deref()),
                    record.direction.as_str(),
                    record.mailbox.clone(),
                    record.uid as i64,
                    envelope,
                    opt_text(record.body_text.as_deref()),
                    opt_text(record.body_html.as_deref()),
                    attachments,
                    record.processed as i64,
                    opt_text(record.related_entity_id.as_deref()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_error("insert_message", e))?;
        }
        _ => {
            conn.execute(
                "UPDATE ingested_messages SET thread_id = ?2, direction = ?3, mailbox = ?4, uid = ?5, envelope = ?6, body_text = ?7, body_html = ?8, attachments = ?9, updated_at = ?10 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    opt_text(record.thread_id.as_deref()),
                    record.direction.as_str(),
                    record.mailbox.clone(),
                    record.uid as i64,
                    envelope,
                    opt_text(record.body_text.as_deref()),
                    opt_text(record.body_html.as_deref()),
                    attachments,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| write_error("update_message", e))?;
        }
    }

    debug!(
        protocol_message_id = %record.protocol_message_id,
        outcome = ?outcome,
        "Message upserted"
    );
    Ok(outcome)
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl MessageRepository for LibSqlStore {
    async fn upsert(
        &self,
        message: &IngestedMessage,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, DatabaseError> {
        validate_message(message)?;
        cancellable(cancel, async {
            let _guard = self.write_lock.lock().await;
            upsert_on(self.conn(), message).await
        })
        .await
    }

    async fn upsert_batch(
        &self,
        messages: &[IngestedMessage],
        cancel: &CancellationToken,
    ) -> Result<Vec<UpsertOutcome>, DatabaseError> {
        for message in messages {
            validate_message(message)?;
        }
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        cancellable(cancel, async {
            let _guard = self.write_lock.lock().await;
            let tx = self
                .conn()
                .transaction()
                .await
                .map_err(|e| DatabaseError::Query(format!("begin batch: {e}")))?;

            let mut outcomes = Vec::with_capacity(messages.len());
            for message in messages {
                match upsert_on(&tx, message).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        if let Err(rb) = tx.rollback().await {
                            warn!(error = %rb, "Batch rollback failed");
                        }
                        return Err(e);
                    }
                }
            }

            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit batch: {e}")))?;
            debug!(count = outcomes.len(), "Batch committed");
            Ok(outcomes)
        })
        .await
    }

    async fn find_by_protocol_message_id(
        &self,
        protocol_message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestedMessage>, DatabaseError> {
        cancellable(cancel, select_by_protocol_id(self.conn(), protocol_message_id)).await
    }

    async fn find_unprocessed(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        cancellable(cancel, async {
            let rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM ingested_messages WHERE processed = 0 ORDER BY created_at ASC, uid ASC LIMIT ?1"
                    ),
                    params![limit.min(i64::MAX as usize) as i64],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("find_unprocessed: {e}")))?;
            collect_messages(rows, "find_unprocessed").await
        })
        .await
    }

    async fn find_by_thread_ancestry(
        &self,
        protocol_message_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        if protocol_message_ids.is_empty() {
            return Ok(Vec::new());
        }
        cancellable(cancel, async {
            let placeholders: Vec<String> = (1..=protocol_message_ids.len())
                .map(|i| format!("?{i}"))
                .collect();
            let values: Vec<libsql::Value> = protocol_message_ids
                .iter()
                .map(|id| libsql::Value::Text(id.clone()))
                .collect();
            let rows = self
                .conn()
                .query(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM ingested_messages WHERE protocol_message_id IN ({})",
                        placeholders.join(", ")
                    ),
                    values,
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("find_by_thread_ancestry: {e}")))?;
            collect_messages(rows, "find_by_thread_ancestry").await
        })
        .await
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        related_entity_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError> {
        cancellable(cancel, async {
            let count = self
                .conn()
                .execute(
                    "UPDATE ingested_messages SET processed = 1, related_entity_id = COALESCE(?2, related_entity_id), updated_at = ?3 WHERE id = ?1",
                    params![id.to_string(), opt_text(related_entity_id), Utc::now().to_rfc3339()],
                )
                .await
                .map_err(|e| write_error("mark_processed", e))?;
            Ok(count > 0)
        })
        .await
    }
}

#[async_trait]
impl CursorStore for LibSqlStore {
    async fn load_cursor(
        &self,
        mailbox: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MailboxCursor>, DatabaseError> {
        cancellable(cancel, async {
            let mut rows = self
                .conn()
                .query(
                    "SELECT last_seen_uid FROM mailbox_cursors WHERE mailbox = ?1",
                    params![mailbox],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("load_cursor: {e}")))?;

            match rows.next().await {
                Ok(Some(row)) => {
                    let uid: i64 = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("load_cursor row parse: {e}")))?;
                    Ok(Some(MailboxCursor::new(mailbox, uid.max(0) as u64)))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(DatabaseError::Query(format!("load_cursor: {e}"))),
            }
        })
        .await
    }

    async fn save_cursor(
        &self,
        cursor: &MailboxCursor,
        cancel: &CancellationToken,
    ) -> Result<MailboxCursor, DatabaseError> {
        cancellable(cancel, async {
            let _guard = self.write_lock.lock().await;
            self.conn()
                .execute(
                    "INSERT INTO mailbox_cursors (mailbox, last_seen_uid, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(mailbox) DO UPDATE SET
                        last_seen_uid = MAX(last_seen_uid, excluded.last_seen_uid),
                        updated_at = excluded.updated_at",
                    params![
                        cursor.mailbox.clone(),
                        cursor.last_seen_uid as i64,
                        Utc::now().to_rfc3339()
                    ],
                )
                .await
                .map_err(|e| write_error("save_cursor", e))?;
            Ok(())
        })
        .await?;

        self.load_cursor(&cursor.mailbox, cancel)
            .await?
            .ok_or_else(|| DatabaseError::Query("save_cursor: cursor row missing after write".into()))
    }
}
