//! Error types for mail ingestion.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the ingestion daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled before completion")]
    Cancelled,
}

/// Deadline class an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connect,
    Login,
    Fetch,
    /// The whole poll cycle.
    Operation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Login => "login",
            Phase::Fetch => "fetch",
            Phase::Operation => "operation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mailbox session, paging and commit failures.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication rejected for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("{phase} timed out after {elapsed:?}")]
    Timeout { phase: Phase, elapsed: Duration },

    #[error("Fetch failed for chunk {chunk} (UIDs {first_uid}..={last_uid}): {reason}")]
    Fetch {
        chunk: usize,
        first_uid: u64,
        last_uid: u64,
        reason: String,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] DatabaseError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Cycle budget ran out after {elapsed:?} ({attempts} attempts): {source}")]
    BudgetExhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Whether the governor may retry the failed attempt.
    ///
    /// Timeouts of the overall cycle budget are never retried: there is no
    /// budget left to retry in.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Connection(_) | IngestError::Protocol(_) | IngestError::Fetch { .. } => {
                true
            }
            IngestError::Timeout { phase, .. } => *phase != Phase::Operation,
            IngestError::Auth { .. }
            | IngestError::MailboxNotFound(_)
            | IngestError::Repository(_)
            | IngestError::Cancelled
            | IngestError::RetriesExhausted { .. }
            | IngestError::BudgetExhausted { .. } => false,
        }
    }

    /// Failures that will not clear up on their own and need an operator.
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Auth { .. } | IngestError::MailboxNotFound(_) => true,
            IngestError::RetriesExhausted { source, .. }
            | IngestError::BudgetExhausted { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The root cause is not retryable: another cycle will fail the same way.
    ///
    /// Cancellation and a spent cycle budget are never permanent; the next
    /// cycle starts with a fresh budget.
    pub fn is_permanent(&self) -> bool {
        match self.root() {
            IngestError::Cancelled
            | IngestError::Timeout {
                phase: Phase::Operation,
                ..
            } => false,
            root => !root.is_retryable(),
        }
    }

    /// The innermost error, unwrapping retry and budget exhaustion.
    pub fn root(&self) -> &IngestError {
        match self {
            IngestError::RetriesExhausted { source, .. }
            | IngestError::BudgetExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            IngestError::Connection(_) => "connection",
            IngestError::Auth { .. } => "auth",
            IngestError::Protocol(_) => "protocol",
            IngestError::MailboxNotFound(_) => "mailbox_not_found",
            IngestError::Timeout { .. } => "timeout",
            IngestError::Fetch { .. } => "fetch",
            IngestError::Repository(_) => "repository",
            IngestError::Cancelled => "cancelled",
            IngestError::RetriesExhausted { .. } => "retries_exhausted",
            IngestError::BudgetExhausted { .. } => "budget_exhausted",
        }
    }

    /// Phase tag of a (possibly wrapped) timeout.
    pub fn timed_out_phase(&self) -> Option<Phase> {
        match self.root() {
            IngestError::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
