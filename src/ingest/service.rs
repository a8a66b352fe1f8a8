//! Ingestion service: one poll cycle as a state machine.
//!
//! `Idle → Connecting → Paging → Processing → Committing → Idle`, with
//! `Aborted` reachable from every non-idle state. Nothing is written and the
//! cursor does not move unless the cycle reaches `Committing` and the batch
//! lands as a whole.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::{DatabaseError, IngestError, Phase};
use crate::governor::Governor;
use crate::ingest::model::{
    CycleHistory, CycleOutcome, CycleReport, CycleState, Direction, IngestedMessage,
    MailboxCursor, Quarantined, RejectReason, Rejection, ReplyCandidate, UpsertOutcome,
};
use crate::ingest::policy::{PolicyGate, SpamClassifier, SpamVerdict};
use crate::ingest::thread::{resolve_thread, thread_candidates};
use crate::mailbox::parse::{FetchedMessage, MessageContent, extract_content};
use crate::mailbox::{Pager, Session};
use crate::store::traits::{CursorStore, MessageRepository};

fn repo_err(e: DatabaseError) -> IngestError {
    match e {
        DatabaseError::Cancelled => IngestError::Cancelled,
        other => IngestError::Repository(other),
    }
}

/// Drives poll cycles for one mailbox.
pub struct IngestionService {
    config: Arc<IngestConfig>,
    session: Arc<Session>,
    repo: Arc<dyn MessageRepository>,
    cursors: Arc<dyn CursorStore>,
    classifier: Arc<dyn SpamClassifier>,
    gate: PolicyGate,
    state: watch::Sender<CycleState>,
    history: watch::Sender<CycleHistory>,
    cycle_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl IngestionService {
    pub fn new(
        config: Arc<IngestConfig>,
        session: Arc<Session>,
        repo: Arc<dyn MessageRepository>,
        cursors: Arc<dyn CursorStore>,
        classifier: Arc<dyn SpamClassifier>,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        let (history, _) = watch::channel(CycleHistory::default());
        Self {
            gate: PolicyGate::new(&config.policy),
            config,
            session,
            repo,
            cursors,
            classifier,
            state,
            history,
            cycle_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current state of the cycle state machine.
    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    /// Finished-cycle history, as read by the health reporter.
    pub fn subscribe_history(&self) -> watch::Receiver<CycleHistory> {
        self.history.subscribe()
    }

    /// Cancelling this token aborts the running cycle and stops the poller.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn transition(&self, next: CycleState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "Cycle state changed");
        }
    }

    /// Run one poll cycle.
    ///
    /// Returns immediately with `CycleOutcome::Skipped` when another cycle is
    /// still in flight.
    pub async fn run_cycle(&self) -> CycleReport {
        let Ok(_running) = self.cycle_lock.try_lock() else {
            debug!("Previous cycle still running, skipping tick");
            let mut report = CycleReport::new(Uuid::new_v4(), 0);
            report.outcome = CycleOutcome::Skipped;
            return report;
        };

        let started = Instant::now();
        let gov = Governor::new(
            self.config.timeouts,
            self.config.retry,
            self.shutdown.child_token(),
        );
        let mut report = CycleReport::new(Uuid::new_v4(), 0);
        info!(
            cycle_id = %report.cycle_id,
            mailbox = %self.config.imap.mailbox,
            "Poll cycle started"
        );

        let result = self.execute(&gov, &mut report).await;
        report.duration = started.elapsed();
        report.retries = gov.retries();

        match result {
            Ok(()) => {
                info!(
                    cycle_id = %report.cycle_id,
                    found = report.found,
                    persisted = report.persisted,
                    duplicates = report.duplicates,
                    rejected = report.rejected.len(),
                    quarantined = report.quarantined.len(),
                    deferred = report.deferred,
                    cursor = report.cursor_after,
                    duration_ms = report.duration.as_millis() as u64,
                    "Poll cycle completed"
                );
            }
            Err(err) => {
                let state = self.state();
                self.transition(CycleState::Aborted);
                report.discard_uncommitted();
                error!(
                    cycle_id = %report.cycle_id,
                    state = %state,
                    kind = err.kind(),
                    phase = ?err.timed_out_phase(),
                    elapsed_ms = report.duration.as_millis() as u64,
                    operator_alert = err.is_fatal(),
                    error = %err,
                    "Poll cycle aborted"
                );
                report.outcome = CycleOutcome::Aborted {
                    state,
                    error: Arc::new(err),
                };
            }
        }

        self.history.send_modify(|h| h.record(&report));
        self.transition(CycleState::Idle);
        report
    }

    /// Repository call bounded by what is left of the cycle budget.
    async fn repo_step<T, Fut>(&self, gov: &Governor, fut: Fut) -> Result<T, IngestError>
    where
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        gov.bounded(Phase::Operation, async { fut.await.map_err(repo_err) })
            .await
    }

    async fn execute(&self, gov: &Governor, report: &mut CycleReport) -> Result<(), IngestError> {
        let mailbox = self.config.imap.mailbox.as_str();
        let cancel = gov.cancellation();

        // Connecting
        self.transition(CycleState::Connecting);
        let mut cursor = self
            .repo_step(gov, self.cursors.load_cursor(mailbox, cancel))
            .await?
            .unwrap_or_else(|| MailboxCursor::new(mailbox, self.config.poll.initial_uid));
        report.cursor_before = cursor.last_seen_uid;
        report.cursor_after = cursor.last_seen_uid;
        let info = self.session.ensure_connected(gov).await?;

        // Paging
        self.transition(CycleState::Paging);
        let pager = Pager::new(&self.session, gov, &self.config.poll);
        let mut uids = pager.search(cursor.last_seen_uid).await?;
        report.found = uids.len();

        let cap = self.config.poll.max_messages_per_poll.max(1);
        if uids.len() > cap {
            report.deferred = uids.len() - cap;
            uids.truncate(cap);
            debug!(cap, deferred = report.deferred, "Deferring UIDs beyond per-poll cap");
        }
        if uids.is_empty() {
            debug!(cursor = cursor.last_seen_uid, "No new messages");
            return Ok(());
        }

        let mut fetched: Vec<FetchedMessage> = Vec::with_capacity(uids.len());
        let mut page = pager.fetch_page(&uids);
        while let Some(chunk) = page.next_chunk().await {
            let chunk = chunk?;
            report.vanished.extend(chunk.missing.iter().copied());
            report
                .rejected
                .extend(chunk.unparseable.iter().map(|uid| Rejection {
                    uid: *uid,
                    protocol_message_id: None,
                    reason: RejectReason::Unparseable,
                }));
            fetched.extend(chunk.messages);
        }
        report.fetched = fetched.len();
        fetched.sort_by_key(|m| m.uid);

        // Processing
        self.transition(CycleState::Processing);
        let batch = self.process(gov, fetched, report).await?;

        // Committing
        self.transition(CycleState::Committing);
        if !batch.is_empty() {
            let outcomes = self
                .repo_step(gov, self.repo.upsert_batch(&batch, cancel))
                .await?;
            report.persisted = outcomes
                .iter()
                .filter(|o| **o != UpsertOutcome::Unchanged)
                .count();
            report.duplicates += outcomes.len() - report.persisted;
        }

        if let Some(&highest) = uids.last() {
            cursor.advance_to(highest);
        }
        let saved = self
            .repo_step(gov, self.cursors.save_cursor(&cursor, cancel))
            .await?;
        report.cursor_after = saved.last_seen_uid;

        if !self.config.suppress_server_writes() && !info.read_only {
            let vanished: HashSet<u64> = report.vanished.iter().copied().collect();
            let seen: Vec<u64> = uids.into_iter().filter(|u| !vanished.contains(u)).collect();
            if !seen.is_empty()
                && let Err(e) = self.session.mark_seen(gov, &seen).await
            {
                warn!(error = %e, count = seen.len(), "Failed to mark messages as seen");
            }
        }
        Ok(())
    }

    /// Policy, spam, dedup and threading for fetched messages in UID order.
    /// Returns the batch to commit.
    async fn process(
        &self,
        gov: &Governor,
        fetched: Vec<FetchedMessage>,
        report: &mut CycleReport,
    ) -> Result<Vec<IngestedMessage>, IngestError> {
        let mailbox = self.config.imap.mailbox.as_str();
        let cancel = gov.cancellation();
        let mut batch: Vec<IngestedMessage> = Vec::new();
        let mut in_batch: HashSet<String> = HashSet::new();
        let mut known_threads: HashMap<String, String> = HashMap::new();

        for msg in fetched {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let pid = msg.envelope.protocol_message_id.clone();

            if let Err(reason) = self.gate.evaluate(&msg) {
                warn!(uid = msg.uid, protocol_message_id = %pid, ?reason, "Message rejected by policy");
                report.rejected.push(Rejection {
                    uid: msg.uid,
                    protocol_message_id: Some(pid),
                    reason,
                });
                continue;
            }

            if self.config.policy.spam_filter
                && let SpamVerdict::Spam { reason } = self.classifier.classify(&msg).await
            {
                warn!(uid = msg.uid, protocol_message_id = %pid, %reason, "Message quarantined as spam");
                report.quarantined.push(Quarantined {
                    uid: msg.uid,
                    protocol_message_id: pid,
                    reason,
                });
                continue;
            }

            if in_batch.contains(&pid)
                || self
                    .repo_step(gov, self.repo.find_by_protocol_message_id(&pid, cancel))
                    .await?
                    .is_some()
            {
                debug!(uid = msg.uid, protocol_message_id = %pid, "Already ingested, skipping");
                report.duplicates += 1;
                continue;
            }

            let unresolved: Vec<String> = thread_candidates(&msg.envelope)
                .into_iter()
                .filter(|id| !known_threads.contains_key(id))
                .collect();
            if !unresolved.is_empty() {
                let ancestors = self
                    .repo_step(gov, self.repo.find_by_thread_ancestry(&unresolved, cancel))
                    .await?;
                for ancestor in ancestors {
                    let thread = ancestor
                        .thread_id
                        .unwrap_or_else(|| ancestor.protocol_message_id.clone());
                    known_threads.insert(ancestor.protocol_message_id, thread);
                }
            }
            let thread_id = resolve_thread(&msg.envelope, &known_threads);
            known_threads.insert(pid.clone(), thread_id.clone());

            let direction = self.gate.direction(msg.envelope.from.as_deref());
            let content = if msg.headers_only {
                MessageContent::default()
            } else {
                extract_content(&msg.raw)
            };
            let record = IngestedMessage::from_fetched(&msg, mailbox, thread_id, direction, content);

            if self.config.policy.auto_reply && direction == Direction::Incoming {
                report.reply_candidates.push(ReplyCandidate {
                    message_id: record.id,
                    protocol_message_id: pid.clone(),
                    from: record.envelope.from.clone(),
                    subject: record.envelope.subject.clone(),
                });
            }

            in_batch.insert(pid);
            batch.push(record);
        }

        Ok(batch)
    }
}
