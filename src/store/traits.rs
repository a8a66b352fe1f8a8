//! Repository port: the persistence contract the ingestion service consumes.
//!
//! Every operation takes a cancellation token and returns
//! `DatabaseError::Cancelled` promptly instead of completing a stale write.
//! Not-found is `Ok(None)` / an empty vec, never an error.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ingest::model::{IngestedMessage, MailboxCursor, UpsertOutcome};

/// Message persistence keyed by protocol message id.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert or update by `protocol_message_id`. Re-upserting identical
    /// content is a no-op. An existing record keeps its local id, creation
    /// time and processing state.
    async fn upsert(
        &self,
        message: &IngestedMessage,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, DatabaseError>;

    /// Upsert all messages atomically: either every message is stored or none.
    async fn upsert_batch(
        &self,
        messages: &[IngestedMessage],
        cancel: &CancellationToken,
    ) -> Result<Vec<UpsertOutcome>, DatabaseError>;

    async fn find_by_protocol_message_id(
        &self,
        protocol_message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestedMessage>, DatabaseError>;

    /// Oldest unprocessed messages first, at most `limit`.
    async fn find_unprocessed(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError>;

    /// Messages whose protocol id is one of `protocol_message_ids`.
    async fn find_by_thread_ancestry(
        &self,
        protocol_message_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError>;

    /// Set `processed` and optionally attach a related entity.
    /// Returns `false` when no message has that id.
    async fn mark_processed(
        &self,
        id: Uuid,
        related_entity_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError>;
}

/// Durable per-mailbox cursor.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(
        &self,
        mailbox: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MailboxCursor>, DatabaseError>;

    /// Store the cursor, never lowering an existing value. Returns what is
    /// stored afterwards.
    async fn save_cursor(
        &self,
        cursor: &MailboxCursor,
        cancel: &CancellationToken,
    ) -> Result<MailboxCursor, DatabaseError>;
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    if cancel.is_cancelled() {
        return Err(DatabaseError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DatabaseError::Cancelled),
        res = fut => res,
    }
}

/// Reject records that can never satisfy the uniqueness contract.
pub fn validate_message(message: &IngestedMessage) -> Result<(), DatabaseError> {
    if message.protocol_message_id.trim().is_empty() {
        return Err(DatabaseError::Constraint(format!(
            "message {} has an empty protocol_message_id",
            message.id
        )));
    }
    Ok(())
}

/// Record to store when `incoming` is upserted over `existing`, or `None`
/// when nothing changed. Identity, creation time and processing state of the
/// existing record are kept; a thread id, once attached, is not replaced.
pub fn merge_upsert(existing: &IngestedMessage, incoming: &IngestedMessage) -> Option<IngestedMessage> {
    let mut merged = incoming.clone();
    merged.id = existing.id;
    merged.created_at = existing.created_at;
    merged.processed = existing.processed;
    merged.related_entity_id = existing.related_entity_id.clone();
    if existing.thread_id.is_some() {
        merged.thread_id = existing.thread_id.clone();
    }
    if merged.same_content(existing) {
        return None;
    }
    merged.updated_at = chrono::Utc::now();
    Some(merged)
}
