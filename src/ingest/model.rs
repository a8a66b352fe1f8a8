//! Ingestion data model: cursor, persisted messages, and cycle reports.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;
use crate::mailbox::parse::{AttachmentMeta, Envelope, FetchedMessage, MessageContent};

/// Highest processed UID of a mailbox. Never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCursor {
    pub mailbox: String,
    pub last_seen_uid: u64,
}

impl MailboxCursor {
    pub fn new(mailbox: impl Into<String>, last_seen_uid: u64) -> Self {
        Self {
            mailbox: mailbox.into(),
            last_seen_uid,
        }
    }

    /// Move forward to `uid`. Returns whether the cursor changed.
    pub fn advance_to(&mut self, uid: u64) -> bool {
        if uid > self.last_seen_uid {
            self.last_seen_uid = uid;
            true
        } else {
            false
        }
    }
}

/// Whether a message was received or sent by the mailbox owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// A message as persisted by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedMessage {
    /// Local identity; never taken from the server.
    pub id: Uuid,
    /// Natural dedup key, unique within the repository.
    pub protocol_message_id: String,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub mailbox: String,
    pub uid: u64,
    pub envelope: Envelope,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub processed: bool,
    pub related_entity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestedMessage {
    /// Build a fresh record for a message seen for the first time.
    pub fn from_fetched(
        fetched: &FetchedMessage,
        mailbox: &str,
        thread_id: String,
        direction: Direction,
        content: MessageContent,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            protocol_message_id: fetched.envelope.protocol_message_id.clone(),
            thread_id: Some(thread_id),
            direction,
            mailbox: mailbox.to_string(),
            uid: fetched.uid,
            envelope: fetched.envelope.clone(),
            body_text: content.text,
            body_html: content.html,
            attachments: content.attachments,
            processed: false,
            related_entity_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same message content, ignoring identity, timestamps and processing state.
    pub fn same_content(&self, other: &IngestedMessage) -> bool {
        self.protocol_message_id == other.protocol_message_id
            && self.thread_id == other.thread_id
            && self.direction == other.direction
            && self.envelope == other.envelope
            && self.body_text == other.body_text
            && self.body_html == other.body_html
            && self.attachments == other.attachments
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// States of the poll-cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Connecting,
    Paging,
    Processing,
    Committing,
    Aborted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Connecting => "connecting",
            CycleState::Paging => "paging",
            CycleState::Processing => "processing",
            CycleState::Committing => "committing",
            CycleState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a message was not persisted. Not an error: the cursor still advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    Oversize { size: u64, limit: u64 },
    BlockedSender { sender: String },
    SenderNotAllowed { sender: Option<String> },
    /// Headers-only fetch and the server reported no size.
    SizeUnknown,
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub uid: u64,
    pub protocol_message_id: Option<String>,
    #[serde(flatten)]
    pub reason: RejectReason,
}

/// A message routed to quarantine by the spam classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quarantined {
    pub uid: u64,
    pub protocol_message_id: String,
    pub reason: String,
}

/// An accepted incoming message eligible for an automatic reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyCandidate {
    pub message_id: Uuid,
    pub protocol_message_id: String,
    pub from: Option<String>,
    pub subject: Option<String>,
}

/// How a cycle ended.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed,
    /// Ended on an unrecoverable error; the cursor was not advanced.
    Aborted {
        state: CycleState,
        error: Arc<IngestError>,
    },
    /// Another cycle was still running.
    Skipped,
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed)
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            CycleOutcome::Aborted { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Everything a cycle did, returned to the caller.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: CycleOutcome,
    pub cursor_before: u64,
    pub cursor_after: u64,
    /// UIDs the search returned.
    pub found: usize,
    pub fetched: usize,
    pub persisted: usize,
    pub duplicates: usize,
    pub rejected: Vec<Rejection>,
    pub quarantined: Vec<Quarantined>,
    /// UIDs beyond the per-poll cap, left for later cycles.
    pub deferred: usize,
    /// Requested UIDs that had been expunged by the time of the fetch.
    pub vanished: Vec<u64>,
    pub retries: u32,
    pub reply_candidates: Vec<ReplyCandidate>,
}

impl CycleReport {
    pub fn new(cycle_id: Uuid, cursor: u64) -> Self {
        Self {
            cycle_id,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            outcome: CycleOutcome::Completed,
            cursor_before: cursor,
            cursor_after: cursor,
            found: 0,
            fetched: 0,
            persisted: 0,
            duplicates: 0,
            rejected: Vec::new(),
            quarantined: Vec::new(),
            deferred: 0,
            vanished: Vec::new(),
            retries: 0,
            reply_candidates: Vec::new(),
        }
    }

    /// Forget per-message results of an aborted cycle. Nothing was committed,
    /// so every one of those UIDs is fetched again next cycle.
    pub fn discard_uncommitted(&mut self) {
        self.cursor_after = self.cursor_before;
        self.persisted = 0;
        self.duplicates = 0;
        self.rejected.clear();
        self.quarantined.clear();
        self.reply_candidates.clear();
    }

    pub fn summary(&self) -> CycleSummary {
        let (failed_state, error, error_kind, permanent) = match &self.outcome {
            CycleOutcome::Aborted { state, error } => (
                Some(*state),
                Some(error.to_string()),
                Some(error.kind()),
                error.is_permanent(),
            ),
            _ => (None, None, None, false),
        };
        CycleSummary {
            cycle_id: self.cycle_id,
            started_at: self.started_at,
            duration_ms: self.duration.as_millis() as u64,
            completed: self.outcome.is_completed(),
            failed_state,
            error,
            error_kind,
            permanent,
            cursor_after: self.cursor_after,
            persisted: self.persisted,
            rejected: self.rejected.len(),
            quarantined: self.quarantined.len(),
            deferred: self.deferred,
        }
    }
}

/// Serializable digest of a finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub completed: bool,
    pub failed_state: Option<CycleState>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    /// The abort cause will not clear up by retrying.
    pub permanent: bool,
    pub cursor_after: u64,
    pub persisted: usize,
    pub rejected: usize,
    pub quarantined: usize,
    pub deferred: usize,
}

/// Rolling record of finished cycles, published for health sampling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleHistory {
    pub last: Option<CycleSummary>,
    pub consecutive_aborts: u32,
    pub consecutive_permanent_aborts: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub total_persisted: u64,
}

impl CycleHistory {
    /// Fold a finished cycle in. Skipped cycles are ignored.
    pub fn record(&mut self, report: &CycleReport) {
        match &report.outcome {
            CycleOutcome::Skipped => return,
            CycleOutcome::Completed => {
                self.consecutive_aborts = 0;
                self.consecutive_permanent_aborts = 0;
                self.last_success_at = Some(Utc::now());
                self.total_persisted += report.persisted as u64;
            }
            CycleOutcome::Aborted { error, .. } => {
                self.consecutive_aborts += 1;
                if error.is_permanent() {
                    self.consecutive_permanent_aborts += 1;
                } else {
                    self.consecutive_permanent_aborts = 0;
                }
            }
        }
        self.cycles += 1;
        self.last = Some(report.summary());
    }
}
