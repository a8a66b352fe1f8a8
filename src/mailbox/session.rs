//! Long-lived mailbox session with reconnect.
//!
//! The session owns at most one open transport. Commands lock it for their
//! duration; observers read [`SessionSnapshot`]s published on a watch channel
//! and never touch the lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::config::{ImapConfig, IngestConfig};
use crate::error::{IngestError, Phase};
use crate::governor::Governor;
use crate::mailbox::transport::{Connector, MailTransport, MailboxInfo, RawMessage};

/// Point-in-time view of session state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub mailbox: Option<MailboxInfo>,
    /// Successful connection setups since start.
    pub connects: u64,
}

/// Something that can report connection liveness without doing I/O.
pub trait LivenessSource: Send + Sync {
    fn liveness(&self) -> SessionSnapshot;
}

/// One mail server session.
pub struct Session {
    imap: ImapConfig,
    logout_timeout: Duration,
    connector: Arc<dyn Connector>,
    conn: Mutex<Option<Box<dyn MailTransport>>>,
    state: watch::Sender<SessionSnapshot>,
}

fn not_connected() -> IngestError {
    IngestError::Connection("session is not connected".into())
}

/// Whether the transport can no longer be trusted after `err`.
fn leaves_stream_broken(err: &IngestError) -> bool {
    matches!(
        err,
        IngestError::Connection(_) | IngestError::Timeout { .. } | IngestError::Cancelled
    )
}

/// The cycle is over: no reconnect attempt is worth making.
fn ends_cycle(err: &IngestError) -> bool {
    matches!(
        err,
        IngestError::Cancelled
            | IngestError::Timeout {
                phase: Phase::Operation,
                ..
            }
    )
}

impl Session {
    pub fn new(config: &IngestConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            imap: config.imap.clone(),
            logout_timeout: config.timeouts.connect,
            connector,
            conn: Mutex::new(None),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Metadata of the currently selected mailbox.
    pub fn mailbox(&self) -> Option<MailboxInfo> {
        self.state.borrow().mailbox.clone()
    }

    /// Connect, authenticate and select, or probe an existing connection.
    ///
    /// Retryable failures are retried by the governor under `Phase::Connect`.
    pub async fn ensure_connected(&self, gov: &Governor) -> Result<MailboxInfo, IngestError> {
        gov.retry(Phase::Connect, || self.ensure_connected_once(gov))
            .await
    }

    /// Single attempt of [`Session::ensure_connected`].
    ///
    /// A failed probe discards the handle and runs the full connect sequence
    /// once.
    pub async fn ensure_connected_once(&self, gov: &Governor) -> Result<MailboxInfo, IngestError> {
        let mut conn = self.conn.lock().await;

        if let Some(transport) = conn.as_mut() {
            match gov.bounded(Phase::Connect, transport.noop()).await {
                Ok(()) => {
                    self.state
                        .send_modify(|s| s.last_probe_at = Some(Utc::now()));
                    if let Some(info) = self.mailbox() {
                        return Ok(info);
                    }
                }
                Err(e) if ends_cycle(&e) => {
                    self.discard(&mut conn, &e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Liveness probe failed, reconnecting");
                    self.discard(&mut conn, &e);
                }
            }
        }

        match self.open(gov).await {
            Ok((transport, info)) => {
                *conn = Some(transport);
                let now = Utc::now();
                self.state.send_modify(|s| {
                    s.connected = true;
                    s.connected_at = Some(now);
                    s.last_probe_at = Some(now);
                    s.last_error = None;
                    s.mailbox = Some(info.clone());
                    s.connects += 1;
                });
                info!(
                    mailbox = %info.name,
                    exists = info.exists,
                    uid_validity = ?info.uid_validity,
                    "Mailbox session established"
                );
                Ok(info)
            }
            Err(e) => {
                self.state.send_modify(|s| {
                    s.connected = false;
                    s.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    /// connect -> login -> select, each under its own phase deadline.
    async fn open(
        &self,
        gov: &Governor,
    ) -> Result<(Box<dyn MailTransport>, MailboxInfo), IngestError> {
        debug!(host = %self.imap.host, port = self.imap.port, "Connecting to mail server");
        let mut transport = gov
            .bounded(Phase::Connect, self.connector.connect(&self.imap))
            .await?;
        gov.bounded(
            Phase::Login,
            transport.login(&self.imap.username, &self.imap.password),
        )
        .await?;
        let info = gov
            .bounded(
                Phase::Connect,
                transport.select(&self.imap.mailbox, self.imap.read_only),
            )
            .await?;
        Ok((transport, info))
    }

    /// Select another mailbox on the open connection.
    pub async fn select_mailbox(
        &self,
        gov: &Governor,
        name: &str,
        read_only: bool,
    ) -> Result<MailboxInfo, IngestError> {
        let mut conn = self.conn.lock().await;
        let transport = conn.as_mut().ok_or_else(not_connected)?;
        let res = gov
            .bounded(Phase::Connect, transport.select(name, read_only))
            .await;
        match &res {
            Ok(info) => self.state.send_modify(|s| s.mailbox = Some(info.clone())),
            Err(e) if leaves_stream_broken(e) => self.discard(&mut conn, e),
            Err(_) => {}
        }
        res
    }

    /// UIDs greater than `since_uid`. Single attempt.
    pub async fn uid_search(&self, gov: &Governor, since_uid: u64) -> Result<Vec<u64>, IngestError> {
        let mut conn = self.conn.lock().await;
        let transport = conn.as_mut().ok_or_else(not_connected)?;
        let res = gov
            .bounded(Phase::Fetch, transport.uid_search(since_uid))
            .await;
        if let Err(e) = &res
            && leaves_stream_broken(e)
        {
            self.discard(&mut conn, e);
        }
        res
    }

    /// Fetch records for `uids`. Single attempt.
    pub async fn uid_fetch(
        &self,
        gov: &Governor,
        uids: &[u64],
        include_body: bool,
    ) -> Result<Vec<RawMessage>, IngestError> {
        let mut conn = self.conn.lock().await;
        let transport = conn.as_mut().ok_or_else(not_connected)?;
        let res = gov
            .bounded(Phase::Fetch, transport.uid_fetch(uids, include_body))
            .await;
        if let Err(e) = &res
            && leaves_stream_broken(e)
        {
            self.discard(&mut conn, e);
        }
        res
    }

    /// Flag `uids` as seen. Single attempt.
    pub async fn mark_seen(&self, gov: &Governor, uids: &[u64]) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().await;
        let transport = conn.as_mut().ok_or_else(not_connected)?;
        let res = gov.bounded(Phase::Fetch, transport.mark_seen(uids)).await;
        if let Err(e) = &res
            && leaves_stream_broken(e)
        {
            self.discard(&mut conn, e);
        }
        res
    }

    /// Best-effort logout. Never fails.
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        let Some(mut transport) = conn.take() else {
            return;
        };
        match tokio::time::timeout(self.logout_timeout, transport.logout()).await {
            Ok(Ok(())) => debug!("Logged out"),
            Ok(Err(e)) => warn!(error = %e, "Logout failed"),
            Err(_) => warn!(timeout = ?self.logout_timeout, "Logout timed out"),
        }
        self.state.send_modify(|s| s.connected = false);
    }

    fn discard(&self, conn: &mut Option<Box<dyn MailTransport>>, err: &IngestError) {
        if conn.take().is_some() {
            debug!(error = %err, "Dropping mailbox connection");
        }
        self.state.send_modify(|s| {
            s.connected = false;
            s.last_error = Some(err.to_string());
        });
    }
}

impl LivenessSource for Session {
    fn liveness(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }
}
