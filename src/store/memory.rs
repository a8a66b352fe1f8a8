//! In-memory repository for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ingest::model::{IngestedMessage, MailboxCursor, UpsertOutcome};
use crate::store::traits::{CursorStore, MessageRepository, merge_upsert, validate_message};

/// Messages keyed by protocol id, plus cursors keyed by mailbox.
#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<HashMap<String, IngestedMessage>>,
    cursors: RwLock<HashMap<String, u64>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// All stored messages, ordered by mailbox UID.
    pub async fn all(&self) -> Vec<IngestedMessage> {
        let mut all: Vec<_> = self.messages.read().await.values().cloned().collect();
        all.sort_by(|a, b| (&a.mailbox, a.uid).cmp(&(&b.mailbox, b.uid)));
        all
    }
}

fn check(cancel: &CancellationToken) -> Result<(), DatabaseError> {
    if cancel.is_cancelled() {
        return Err(DatabaseError::Cancelled);
    }
    Ok(())
}

fn apply(map: &mut HashMap<String, IngestedMessage>, message: &IngestedMessage) -> UpsertOutcome {
    match map.get(&message.protocol_message_id) {
        None => {
            map.insert(message.protocol_message_id.clone(), message.clone());
            UpsertOutcome::Inserted
        }
        Some(existing) => match merge_upsert(existing, message) {
            None => UpsertOutcome::Unchanged,
            Some(merged) => {
                map.insert(message.protocol_message_id.clone(), merged);
                UpsertOutcome::Updated
            }
        },
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn upsert(
        &self,
        message: &IngestedMessage,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, DatabaseError> {
        check(cancel)?;
        validate_message(message)?;
        let mut map = self.messages.write().await;
        check(cancel)?;
        Ok(apply(&mut map, message))
    }

    async fn upsert_batch(
        &self,
        messages: &[IngestedMessage],
        cancel: &CancellationToken,
    ) -> Result<Vec<UpsertOutcome>, DatabaseError> {
        check(cancel)?;
        for message in messages {
            validate_message(message)?;
        }
        let mut map = self.messages.write().await;
        check(cancel)?;
        // No await below: the batch lands as a whole.
        Ok(messages.iter().map(|m| apply(&mut map, m)).collect())
    }

    async fn find_by_protocol_message_id(
        &self,
        protocol_message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestedMessage>, DatabaseError> {
        check(cancel)?;
        Ok(self.messages.read().await.get(protocol_message_id).cloned())
    }

    async fn find_unprocessed(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        check(cancel)?;
        let mut pending: Vec<_> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| !m.processed)
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.uid).cmp(&(b.created_at, b.uid)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn find_by_thread_ancestry(
        &self,
        protocol_message_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        check(cancel)?;
        let map = self.messages.read().await;
        Ok(protocol_message_ids
            .iter()
            .filter_map(|id| map.get(id).cloned())
            .collect())
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        related_entity_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError> {
        check(cancel)?;
        let mut map = self.messages.write().await;
        match map.values_mut().find(|m| m.id == id) {
            Some(message) => {
                message.processed = true;
                if let Some(related) = related_entity_id {
                    message.related_entity_id = Some(related.to_string());
                }
                message.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn load_cursor(
        &self,
        mailbox: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<MailboxCursor>, DatabaseError> {
        check(cancel)?;
        Ok(self
            .cursors
            .read()
            .await
            .get(mailbox)
            .map(|uid| MailboxCursor::new(mailbox, *uid)))
    }

    async fn save_cursor(
        &self,
        cursor: &MailboxCursor,
        cancel: &CancellationToken,
    ) -> Result<MailboxCursor, DatabaseError> {
        check(cancel)?;
        let mut cursors = self.cursors.write().await;
        let stored = cursors.entry(cursor.mailbox.clone()).or_insert(0);
        *stored = (*stored).max(cursor.last_seen_uid);
        Ok(MailboxCursor::new(cursor.mailbox.clone(), *stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::sample_message;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let msg = sample_message("a@x", 1);
        assert_eq!(store.upsert(&msg, &cancel).await.unwrap(), UpsertOutcome::Inserted);

        let mut again = sample_message("a@x", 1);
        again.id = Uuid::new_v4();
        assert_eq!(store.upsert(&again, &cancel).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.len().await, 1);

        let stored = store.find_by_protocol_message_id("a@x", &cancel).await.unwrap().unwrap();
        assert_eq!(stored.id, msg.id);
    }

    #[tokio::test]
    async fn changed_content_updates_but_keeps_identity() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let msg = sample_message("a@x", 1);
        store.upsert(&msg, &cancel).await.unwrap();
        assert!(store.mark_processed(msg.id, Some("ticket-7"), &cancel).await.unwrap());

        let mut edited = sample_message("a@x", 1);
        edited.body_text = Some("edited".into());
        assert_eq!(store.upsert(&edited, &cancel).await.unwrap(), UpsertOutcome::Updated);

        let stored = store.find_by_protocol_message_id("a@x", &cancel).await.unwrap().unwrap();
        assert_eq!(stored.id, msg.id);
        assert!(stored.processed);
        assert_eq!(stored.related_entity_id.as_deref(), Some("ticket-7"));
        assert_eq!(stored.body_text.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn invalid_batch_stores_nothing() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let batch = vec![sample_message("a@x", 1), sample_message("", 2)];
        assert!(matches!(
            store.upsert_batch(&batch, &cancel).await,
            Err(DatabaseError::Constraint(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cancelled_operations_do_not_write() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            store.upsert_batch(&[sample_message("a@x", 1)], &cancel).await,
            Err(DatabaseError::Cancelled)
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unprocessed_and_ancestry_queries() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let a = sample_message("a@x", 1);
        let b = sample_message("b@x", 2);
        store.upsert_batch(&[a.clone(), b.clone()], &cancel).await.unwrap();
        store.mark_processed(a.id, None, &cancel).await.unwrap();

        let pending = store.find_unprocessed(10, &cancel).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].protocol_message_id, "b@x");

        let found = store
            .find_by_thread_ancestry(&["zzz".into(), "a@x".into()], &cancel)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(!store.mark_processed(Uuid::new_v4(), None, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        assert!(store.load_cursor("INBOX", &cancel).await.unwrap().is_none());
        store.save_cursor(&MailboxCursor::new("INBOX", 102), &cancel).await.unwrap();
        let stored = store.save_cursor(&MailboxCursor::new("INBOX", 90), &cancel).await.unwrap();
        assert_eq!(stored.last_seen_uid, 102);
    }
}
