//! Health reporter: tri-state verdict from published snapshots only.
//!
//! Sampling reads the session's liveness snapshot and the cycle history watch
//! channel. It never locks the session and never talks to the server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::HealthConfig;
use crate::ingest::model::{CycleHistory, CycleSummary};
use crate::mailbox::{LivenessSource, SessionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Up => "up",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health reading.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub status: HealthStatus,
    pub detail: String,
    pub session: SessionSnapshot,
    pub last_cycle: Option<CycleSummary>,
    pub consecutive_aborts: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthReporter {
    liveness: Arc<dyn LivenessSource>,
    history: watch::Receiver<CycleHistory>,
    config: HealthConfig,
}

impl HealthReporter {
    pub fn new(
        liveness: Arc<dyn LivenessSource>,
        history: watch::Receiver<CycleHistory>,
        config: HealthConfig,
    ) -> Self {
        Self {
            liveness,
            history,
            config,
        }
    }

    /// Current verdict.
    ///
    /// - `Down`: the last `down_after` cycles all aborted on non-retryable errors
    /// - `Degraded`: no cycle yet, last cycle aborted, session disconnected,
    ///   or the last success is older than `stale_after`
    /// - `Up` otherwise
    pub fn sample(&self) -> HealthSample {
        let session = self.liveness.liveness();
        let history = self.history.borrow().clone();
        let now = Utc::now();

        let (status, detail) = self.verdict(&session, &history, now);

        HealthSample {
            status,
            detail,
            session,
            last_cycle: history.last,
            consecutive_aborts: history.consecutive_aborts,
            last_success_at: history.last_success_at,
            checked_at: now,
        }
    }

    fn verdict(
        &self,
        session: &SessionSnapshot,
        history: &CycleHistory,
        now: DateTime<Utc>,
    ) -> (HealthStatus, String) {
        let last_error = history
            .last
            .as_ref()
            .and_then(|c| c.error.clone())
            .unwrap_or_default();

        if history.consecutive_permanent_aborts >= self.config.down_after.max(1) {
            return (
                HealthStatus::Down,
                format!(
                    "last {} cycles aborted with non-retryable errors: {last_error}",
                    history.consecutive_permanent_aborts
                ),
            );
        }

        let Some(last) = &history.last else {
            return (
                HealthStatus::Degraded,
                "no poll cycle has finished yet".to_string(),
            );
        };

        if !last.completed {
            let state = last
                .failed_state
                .map(|s| s.as_str())
                .unwrap_or("unknown");
            return (
                HealthStatus::Degraded,
                format!(
                    "last cycle aborted in {state} ({} in a row): {last_error}",
                    history.consecutive_aborts
                ),
            );
        }

        if !session.connected {
            let reason = session.last_error.as_deref().unwrap_or("not connected");
            return (
                HealthStatus::Degraded,
                format!("session disconnected, cycles still succeeding: {reason}"),
            );
        }

        if let Some(stale_after) = self.config.stale_after
            && let Some(last_success) = history.last_success_at
        {
            let age = (now - last_success).to_std().unwrap_or_default();
            if age > stale_after {
                return (
                    HealthStatus::Degraded,
                    format!("last successful cycle was {}s ago", age.as_secs()),
                );
            }
        }

        (HealthStatus::Up, "ok".to_string())
    }
}
