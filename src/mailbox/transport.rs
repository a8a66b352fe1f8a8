//! Mailbox protocol capabilities.
//!
//! `Connector` opens a physical connection; `MailTransport` is the command
//! surface of one open connection. The session, pager and tests only talk to
//! these traits, never to a concrete protocol client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;

use crate::config::ImapConfig;
use crate::error::IngestError;

/// Metadata returned when a mailbox is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxInfo {
    pub name: String,
    /// Number of messages in the mailbox.
    pub exists: u32,
    pub unseen: Option<u32>,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u64>,
    pub read_only: bool,
}

/// One record of a UID FETCH response.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub uid: u64,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    /// RFC822.SIZE as reported by the server.
    pub size: Option<u64>,
    /// Full message, or only the header block when fetched headers-only.
    pub data: Vec<u8>,
}

/// Command surface of an open mail server connection.
#[async_trait]
pub trait MailTransport: Send {
    /// Authenticate. A credential rejection is `IngestError::Auth`.
    async fn login(&mut self, username: &str, password: &SecretString) -> Result<(), IngestError>;

    /// Select (or examine, when `read_only`) a mailbox.
    async fn select(&mut self, mailbox: &str, read_only: bool) -> Result<MailboxInfo, IngestError>;

    /// Liveness probe.
    async fn noop(&mut self) -> Result<(), IngestError>;

    /// UIDs of messages with UID greater than `since_uid`, in server order.
    async fn uid_search(&mut self, since_uid: u64) -> Result<Vec<u64>, IngestError>;

    /// Fetch envelope data for `uids`, with full bodies or headers only.
    async fn uid_fetch(
        &mut self,
        uids: &[u64],
        include_body: bool,
    ) -> Result<Vec<RawMessage>, IngestError>;

    /// Flag messages `\Seen`.
    async fn mark_seen(&mut self, uids: &[u64]) -> Result<(), IngestError>;

    async fn logout(&mut self) -> Result<(), IngestError>;
}

/// Opens connections to a mail server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and consume the server greeting. No authentication.
    async fn connect(&self, imap: &ImapConfig) -> Result<Box<dyn MailTransport>, IngestError>;
}

/// Compact UID set for protocol commands: `101:103,107`.
pub fn uid_set(uids: &[u64]) -> String {
    let mut sorted: Vec<u64> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range_str(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_str(start, end));
    parts.join(",")
}

fn range_str(start: u64, end: u64) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}
