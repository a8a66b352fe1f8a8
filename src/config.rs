//! Configuration types.
//!
//! `IngestConfig` is built once at startup (usually via [`IngestConfig::from_env`]),
//! validated, and then shared read-only with every component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Poll intervals shorter than this are rejected.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Mail server connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Open the mailbox with EXAMINE instead of SELECT.
    pub read_only: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            tls: true,
            username: String::new(),
            password: SecretString::from(String::new()),
            mailbox: "INBOX".to_string(),
            read_only: false,
        }
    }
}

/// Scheduling and paging.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub page_size: usize,
    pub max_messages_per_poll: usize,
    /// Fetch full bodies (`true`) or headers only.
    pub fetch_bodies: bool,
    /// Cursor value used the first time a mailbox is seen.
    pub initial_uid: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            page_size: 50,
            max_messages_per_poll: 200,
            fetch_bodies: true,
            initial_uid: 0,
        }
    }
}

/// Per-phase deadlines.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub login: Duration,
    pub fetch: Duration,
    /// Bounds an entire poll cycle.
    pub operation: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            login: Duration::from_secs(10),
            fetch: Duration::from_secs(60),
            operation: Duration::from_secs(300),
        }
    }
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `retry_delay`.
    Fixed,
    /// `retry_delay * 2^attempt`, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

impl FromStr for Backoff {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" | "exp" => Ok(Backoff::Exponential {
                max_delay: Duration::from_secs(30),
            }),
            other => Err(ConfigError::InvalidValue {
                key: "INGEST_RETRY_BACKOFF".into(),
                message: format!("expected 'fixed' or 'exponential', got '{other}'"),
            }),
        }
    }
}

/// Bounded retry policy applied by the governor.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    /// Randomize each delay within `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            jitter: false,
        }
    }
}

/// What may be persisted, evaluated per message.
#[derive(Debug, Clone)]
pub struct ProcessingPolicy {
    /// Suppress server-side side effects such as flagging messages `\Seen`.
    pub read_only_mode: bool,
    pub auto_reply: bool,
    pub spam_filter: bool,
    /// Upper bound on RFC822 size in bytes.
    pub max_message_size: u64,
    /// Empty means everyone is allowed.
    pub allowed_senders: Vec<String>,
    pub blocked_senders: Vec<String>,
    /// Addresses that mark a message as outgoing.
    pub own_addresses: Vec<String>,
}

impl Default for ProcessingPolicy {
    fn default() -> Self {
        Self {
            read_only_mode: false,
            auto_reply: false,
            spam_filter: false,
            max_message_size: 25 * 1024 * 1024,
            allowed_senders: Vec::new(),
            blocked_senders: Vec::new(),
            own_addresses: Vec::new(),
        }
    }
}

/// Health verdict thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Consecutive fatal aborts before reporting `Down`.
    pub down_after: u32,
    /// Report `Degraded` when the last success is older than this.
    pub stale_after: Option<Duration>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            down_after: 3,
            stale_after: None,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub imap: ImapConfig,
    pub poll: PollConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryPolicy,
    pub policy: ProcessingPolicy,
    pub health: HealthConfig,
    pub db_path: PathBuf,
}

impl IngestConfig {
    /// Build config from environment variables.
    ///
    /// `IMAP_HOST` is required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("IMAP_HOST").ok_or_else(|| ConfigError::MissingEnvVar("IMAP_HOST".into()))?;
        let username = lookup("IMAP_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("IMAP_PASSWORD").unwrap_or_default());

        let imap = ImapConfig {
            host,
            port: parse_or(&lookup, "IMAP_PORT", 993)?,
            tls: parse_bool(&lookup, "IMAP_TLS", true)?,
            username: username.clone(),
            password,
            mailbox: lookup("IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            read_only: parse_bool(&lookup, "IMAP_READ_ONLY", false)?,
        };

        let defaults = PollConfig::default();
        let poll = PollConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "INGEST_POLL_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            page_size: parse_or(&lookup, "INGEST_PAGE_SIZE", defaults.page_size)?,
            max_messages_per_poll: parse_or(
                &lookup,
                "INGEST_MAX_MESSAGES_PER_POLL",
                defaults.max_messages_per_poll,
            )?,
            fetch_bodies: parse_bool(&lookup, "INGEST_FETCH_BODIES", true)?,
            initial_uid: parse_or(&lookup, "INGEST_INITIAL_UID", 0)?,
        };

        let t = TimeoutConfig::default();
        let timeouts = TimeoutConfig {
            connect: secs(&lookup, "INGEST_CONNECT_TIMEOUT_SECS", t.connect)?,
            login: secs(&lookup, "INGEST_LOGIN_TIMEOUT_SECS", t.login)?,
            fetch: secs(&lookup, "INGEST_FETCH_TIMEOUT_SECS", t.fetch)?,
            operation: secs(&lookup, "INGEST_OPERATION_TIMEOUT_SECS", t.operation)?,
        };

        let r = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: parse_or(&lookup, "INGEST_MAX_RETRIES", r.max_retries)?,
            retry_delay: Duration::from_millis(parse_or(
                &lookup,
                "INGEST_RETRY_DELAY_MS",
                r.retry_delay.as_millis() as u64,
            )?),
            backoff: match lookup("INGEST_RETRY_BACKOFF") {
                Some(v) => v.parse()?,
                None => r.backoff,
            },
            jitter: parse_bool(&lookup, "INGEST_RETRY_JITTER", r.jitter)?,
        };

        let mut own_addresses = split_list(lookup("INGEST_OWN_ADDRESSES"));
        if own_addresses.is_empty() && username.contains('@') {
            own_addresses.push(username);
        }

        let p = ProcessingPolicy::default();
        let policy = ProcessingPolicy {
            read_only_mode: parse_bool(&lookup, "INGEST_READ_ONLY_MODE", false)?,
            auto_reply: parse_bool(&lookup, "INGEST_AUTO_REPLY", false)?,
            spam_filter: parse_bool(&lookup, "INGEST_SPAM_FILTER", false)?,
            max_message_size: parse_or(&lookup, "INGEST_MAX_MESSAGE_SIZE", p.max_message_size)?,
            allowed_senders: split_list(lookup("INGEST_ALLOWED_SENDERS")),
            blocked_senders: split_list(lookup("INGEST_BLOCKED_SENDERS")),
            own_addresses,
        };

        let stale_secs: u64 = parse_or(&lookup, "INGEST_HEALTH_STALE_SECS", 0)?;
        let health = HealthConfig {
            down_after: parse_or(&lookup, "INGEST_HEALTH_DOWN_AFTER", 3)?,
            stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
        };

        let db_path = lookup("INGEST_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/mail-ingest.db"));

        let config = Self {
            imap,
            poll,
            timeouts,
            retry,
            policy,
            health,
            db_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.imap.host.trim().is_empty() {
            return Err(invalid("IMAP_HOST", "must not be empty"));
        }
        if self.imap.mailbox.trim().is_empty() {
            return Err(invalid("IMAP_MAILBOX", "must not be empty"));
        }
        if self.poll.interval < MIN_POLL_INTERVAL {
            return Err(invalid(
                "INGEST_POLL_INTERVAL_SECS",
                format!(
                    "{}s is below the {}s minimum",
                    self.poll.interval.as_secs(),
                    MIN_POLL_INTERVAL.as_secs()
                ),
            ));
        }
        if self.poll.page_size == 0 {
            return Err(invalid("INGEST_PAGE_SIZE", "must be at least 1"));
        }
        if self.poll.max_messages_per_poll == 0 {
            return Err(invalid("INGEST_MAX_MESSAGES_PER_POLL", "must be at least 1"));
        }
        let t = &self.timeouts;
        let phases = t.connect + t.login + t.fetch;
        if t.operation < phases {
            return Err(invalid(
                "INGEST_OPERATION_TIMEOUT_SECS",
                format!(
                    "{:?} is shorter than connect + login + fetch ({:?})",
                    t.operation, phases
                ),
            ));
        }
        if self.health.down_after == 0 {
            return Err(invalid("INGEST_HEALTH_DOWN_AFTER", "must be at least 1"));
        }
        Ok(())
    }

    /// Whether the server must be left untouched (no flag changes).
    pub fn suppress_server_writes(&self) -> bool {
        self.policy.read_only_mode || self.imap.read_only
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(invalid(key, format!("'{raw}' is not a boolean"))),
        },
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
