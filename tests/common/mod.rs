//! Shared fakes for integration tests: a scripted mail server, a repository
//! that can be told to fail, and config/harness helpers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mail_ingest::config::{Backoff, ImapConfig, IngestConfig};
use mail_ingest::error::{DatabaseError, IngestError};
use mail_ingest::ingest::model::{IngestedMessage, MailboxCursor, UpsertOutcome};
use mail_ingest::ingest::policy::{NoopClassifier, SpamClassifier};
use mail_ingest::ingest::IngestionService;
use mail_ingest::mailbox::{Connector, MailTransport, MailboxInfo, RawMessage, Session};
use mail_ingest::store::{CursorStore, InMemoryStore, LibSqlStore, MessageRepository};

// ── Fake mail server ────────────────────────────────────────────────

/// In-process mailbox with scripted delays and failures.
#[derive(Default)]
pub struct FakeServer {
    pub messages: Mutex<BTreeMap<u64, Vec<u8>>>,
    /// UIDs the search reports but the fetch no longer returns.
    pub ghosts: Mutex<Vec<u64>>,
    pub login_delay: Mutex<Option<Duration>>,
    pub reject_login: AtomicBool,
    /// Number of upcoming fetches that fail with a protocol error.
    pub failing_fetches: AtomicUsize,
    pub read_only_mailbox: AtomicBool,

    pub connects: AtomicUsize,
    pub logins: AtomicUsize,
    pub searches: AtomicUsize,
    pub fetches: AtomicUsize,
    pub fetched_uids: Mutex<Vec<u64>>,
    pub seen: Mutex<Vec<u64>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_messages(messages: Vec<(u64, Vec<u8>)>) -> Arc<Self> {
        let server = Self::new();
        server.messages.lock().unwrap().extend(messages);
        server
    }

    pub fn add(&self, uid: u64, data: Vec<u8>) {
        self.messages.lock().unwrap().insert(uid, data);
    }

    pub fn fetch_count(&self, uid: u64) -> usize {
        self.fetched_uids
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == uid)
            .count()
    }
}

pub struct FakeConnector(pub Arc<FakeServer>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _imap: &ImapConfig) -> Result<Box<dyn MailTransport>, IngestError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            server: Arc::clone(&self.0),
        }))
    }
}

struct FakeTransport {
    server: Arc<FakeServer>,
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn login(&mut self, username: &str, _password: &SecretString) -> Result<(), IngestError> {
        self.server.logins.fetch_add(1, Ordering::SeqCst);
        let delay = *self.server.login_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.server.reject_login.load(Ordering::SeqCst) {
            return Err(IngestError::Auth {
                user: username.to_string(),
                reason: "[AUTHENTICATIONFAILED] Invalid credentials".into(),
            });
        }
        Ok(())
    }

    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxInfo, IngestError> {
        let messages = self.server.messages.lock().unwrap();
        Ok(MailboxInfo {
            name: mailbox.to_string(),
            exists: messages.len() as u32,
            unseen: None,
            uid_validity: Some(7),
            uid_next: messages.keys().next_back().map(|u| u + 1),
            read_only: read_only || self.server.read_only_mailbox.load(Ordering::SeqCst),
        })
    }

    async fn noop(&mut self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn uid_search(&mut self, since_uid: u64) -> Result<Vec<u64>, IngestError> {
        self.server.searches.fetch_add(1, Ordering::SeqCst);
        let mut uids: Vec<u64> = self
            .server
            .messages
            .lock()
            .unwrap()
            .keys()
            .copied()
            .chain(self.server.ghosts.lock().unwrap().iter().copied())
            .filter(|u| *u > since_uid)
            .collect();
        // Servers are not required to answer in order.
        uids.reverse();
        Ok(uids)
    }

    async fn uid_fetch(
        &mut self,
        uids: &[u64],
        _include_body: bool,
    ) -> Result<Vec<RawMessage>, IngestError> {
        self.server.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self.server.failing_fetches.load(Ordering::SeqCst);
        if pending > 0 {
            self.server.failing_fetches.store(pending - 1, Ordering::SeqCst);
            return Err(IngestError::Protocol("BAD internal server error".into()));
        }

        let messages = self.server.messages.lock().unwrap();
        let mut out = Vec::new();
        for uid in uids {
            if let Some(data) = messages.get(uid) {
                self.server.fetched_uids.lock().unwrap().push(*uid);
                out.push(RawMessage {
                    uid: *uid,
                    flags: Vec::new(),
                    internal_date: None,
                    size: Some(data.len() as u64),
                    data: data.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn mark_seen(&mut self, uids: &[u64]) -> Result<(), IngestError> {
        self.server.seen.lock().unwrap().extend_from_slice(uids);
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), IngestError> {
        Ok(())
    }
}

// ── Message builders ────────────────────────────────────────────────

pub fn email(id: &str, from: &str, subject: &str) -> Vec<u8> {
    thread_email(id, from, subject, None, &[])
}

pub fn thread_email(
    id: &str,
    from: &str,
    subject: &str,
    in_reply_to: Option<&str>,
    references: &[&str],
) -> Vec<u8> {
    let mut raw = format!(
        "From: {from}\r\nTo: support@example.com\r\nSubject: {subject}\r\nMessage-ID: <{id}>\r\nDate: Tue, 6 Oct 2026 10:00:00 +0000\r\n"
    );
    if let Some(parent) = in_reply_to {
        raw.push_str(&format!("In-Reply-To: <{parent}>\r\n"));
    }
    if !references.is_empty() {
        let refs: Vec<String> = references.iter().map(|r| format!("<{r}>")).collect();
        raw.push_str(&format!("References: {}\r\n", refs.join(" ")));
    }
    raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\nHello from the test suite.\r\n");
    raw.into_bytes()
}

pub fn email_with_header(id: &str, from: &str, subject: &str, header: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: support@example.com\r\nSubject: {subject}\r\nMessage-ID: <{id}>\r\n{header}\r\nContent-Type: text/plain\r\n\r\nBody\r\n"
    )
    .into_bytes()
}

// ── Repository that can fail on demand ──────────────────────────────

/// In-memory store whose batch upserts fail while `fail_batches` is set.
#[derive(Default)]
pub struct FlakyRepository {
    pub inner: InMemoryStore,
    pub fail_batches: AtomicBool,
    pub batch_calls: AtomicUsize,
}

#[async_trait]
impl MessageRepository for FlakyRepository {
    async fn upsert(
        &self,
        message: &IngestedMessage,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, DatabaseError> {
        self.inner.upsert(message, cancel).await
    }

    async fn upsert_batch(
        &self,
        messages: &[IngestedMessage],
        cancel: &CancellationToken,
    ) -> Result<Vec<UpsertOutcome>, DatabaseError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("disk I/O error on last row".into()));
        }
        self.inner.upsert_batch(messages, cancel).await
    }

    async fn find_by_protocol_message_id(
        &self,
        protocol_message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestedMessage>, DatabaseError> {
        self.inner
            .find_by_protocol_message_id(protocol_message_id, cancel)
            .await
    }

    async fn find_unprocessed(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        self.inner.find_unprocessed(limit, cancel).await
    }

    async fn find_by_thread_ancestry(
        &self,
        protocol_message_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        self.inner
            .find_by_thread_ancestry(protocol_message_ids, cancel)
            .await
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        related_entity_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError> {
        self.inner.mark_processed(id, related_entity_id, cancel).await
    }
}

/// libSQL store whose batches fail on their final insert: the last message
/// is given the local id of the first, so earlier rows are already written
/// inside the transaction when the primary key clashes.
pub struct LastRowClash {
    pub inner: LibSqlStore,
}

#[async_trait]
impl MessageRepository for LastRowClash {
    async fn upsert(
        &self,
        message: &IngestedMessage,
        cancel: &CancellationToken,
    ) -> Result<UpsertOutcome, DatabaseError> {
        self.inner.upsert(message, cancel).await
    }

    async fn upsert_batch(
        &self,
        messages: &[IngestedMessage],
        cancel: &CancellationToken,
    ) -> Result<Vec<UpsertOutcome>, DatabaseError> {
        let mut batch = messages.to_vec();
        if batch.len() > 1 {
            let first_id = batch[0].id;
            if let Some(last) = batch.last_mut() {
                last.id = first_id;
            }
        }
        self.inner.upsert_batch(&batch, cancel).await
    }

    async fn find_by_protocol_message_id(
        &self,
        protocol_message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IngestedMessage>, DatabaseError> {
        self.inner
            .find_by_protocol_message_id(protocol_message_id, cancel)
            .await
    }

    async fn find_unprocessed(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        self.inner.find_unprocessed(limit, cancel).await
    }

    async fn find_by_thread_ancestry(
        &self,
        protocol_message_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<IngestedMessage>, DatabaseError> {
        self.inner
            .find_by_thread_ancestry(protocol_message_ids, cancel)
            .await
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        related_entity_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DatabaseError> {
        self.inner.mark_processed(id, related_entity_id, cancel).await
    }
}

// ── Config + harness ────────────────────────────────────────────────

pub fn test_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.imap.host = "imap.test".into();
    config.imap.username = "support@example.com".into();
    config.imap.password = SecretString::from("hunter2".to_string());
    config.imap.mailbox = "INBOX".into();
    config.poll.interval = Duration::from_secs(10);
    config.poll.page_size = 2;
    config.poll.max_messages_per_poll = 200;
    config.poll.fetch_bodies = true;
    config.poll.initial_uid = 0;
    config.timeouts.connect = Duration::from_secs(1);
    config.timeouts.login = Duration::from_secs(1);
    config.timeouts.fetch = Duration::from_secs(2);
    config.timeouts.operation = Duration::from_secs(60);
    config.retry.max_retries = 2;
    config.retry.retry_delay = Duration::from_millis(10);
    config.retry.backoff = Backoff::Fixed;
    config.retry.jitter = false;
    config
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub store: Arc<InMemoryStore>,
    pub service: Arc<IngestionService>,
}

impl Harness {
    pub fn new(config: IngestConfig, server: Arc<FakeServer>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_store(config, server, store, Arc::new(NoopClassifier))
    }

    pub fn with_store(
        config: IngestConfig,
        server: Arc<FakeServer>,
        store: Arc<InMemoryStore>,
        classifier: Arc<dyn SpamClassifier>,
    ) -> Self {
        let service = build_service(
            config,
            &server,
            store.clone(),
            store.clone(),
            classifier,
        );
        Self {
            server,
            store,
            service,
        }
    }

    pub async fn cursor(&self) -> Option<u64> {
        self.store
            .load_cursor("INBOX", &CancellationToken::new())
            .await
            .unwrap()
            .map(|c| c.last_seen_uid)
    }

    pub async fn set_cursor(&self, uid: u64) {
        self.store
            .save_cursor(&MailboxCursor::new("INBOX", uid), &CancellationToken::new())
            .await
            .unwrap();
    }
}

pub fn build_service(
    config: IngestConfig,
    server: &Arc<FakeServer>,
    repo: Arc<dyn MessageRepository>,
    cursors: Arc<dyn CursorStore>,
    classifier: Arc<dyn SpamClassifier>,
) -> Arc<IngestionService> {
    let config = Arc::new(config);
    let session = Arc::new(Session::new(
        &config,
        Arc::new(FakeConnector(Arc::clone(server))),
    ));
    Arc::new(IngestionService::new(
        config, session, repo, cursors, classifier,
    ))
}
