//! Versioned schema for the libSQL repository.
//!
//! Steps are applied in order, each inside its own transaction together with
//! its `schema_version` row. A database written by a newer build is refused.

use chrono::Utc;
use libsql::{Connection, params};
use tracing::{debug, info};

use crate::error::DatabaseError;

struct SchemaStep {
    version: i64,
    label: &'static str,
    ddl: &'static str,
}

const STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        label: "messages_and_cursors",
        ddl: r#"
            CREATE TABLE IF NOT EXISTS ingested_messages (
                id TEXT PRIMARY KEY,
                protocol_message_id TEXT NOT NULL UNIQUE
                    CHECK (length(protocol_message_id) > 0),
                thread_id TEXT,
                direction TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                envelope TEXT NOT NULL,
                body_text TEXT,
                body_html TEXT,
                attachments TEXT NOT NULL DEFAULT '[]',
                processed INTEGER NOT NULL DEFAULT 0,
                related_entity_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ingested_thread ON ingested_messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_ingested_unprocessed
                ON ingested_messages(processed, created_at);

            CREATE TABLE IF NOT EXISTS mailbox_cursors (
                mailbox TEXT PRIMARY KEY,
                last_seen_uid INTEGER NOT NULL CHECK (last_seen_uid >= 0),
                updated_at TEXT NOT NULL
            );
        "#,
    },
    SchemaStep {
        version: 2,
        label: "mailbox_uid_index",
        ddl: "CREATE INDEX IF NOT EXISTS idx_ingested_mailbox_uid ON ingested_messages(mailbox, uid);",
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    STEPS.last().map_or(0, |s| s.version)
}

/// Bring the schema up to [`latest_version`].
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create schema_version: {e}")))?;

    let current = current_version(conn).await?;
    let latest = latest_version();
    if current > latest {
        return Err(DatabaseError::Migration(format!(
            "database schema V{current} is newer than this build (V{latest})"
        )));
    }

    for step in STEPS.iter().filter(|s| s.version > current) {
        apply(conn, step).await?;
        info!(version = step.version, label = step.label, "Schema step applied");
    }

    debug!(version = latest, "Schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, step: &SchemaStep) -> Result<(), DatabaseError> {
    let fail = |what: &str, e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {} {what}: {e}", step.version, step.label))
    };

    let tx = conn.transaction().await.map_err(|e| fail("begin", e))?;
    tx.execute_batch(step.ddl).await.map_err(|e| fail("ddl", e))?;
    tx.execute(
        "INSERT INTO schema_version (version, label, applied_at) VALUES (?1, ?2, ?3)",
        params![step.version, step.label, Utc::now().to_rfc3339()],
    )
    .await
    .map_err(|e| fail("record", e))?;
    tx.commit().await.map_err(|e| fail("commit", e))
}

/// Highest applied version, 0 for a fresh database.
pub async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema_version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parse schema_version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read schema_version: {e}"))),
    }
}
