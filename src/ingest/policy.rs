//! Processing policy gate and spam classification.
//!
//! The gate decides, per message, whether it may be persisted:
//! - RFC822 size above `max_message_size`, or not known at all → rejected
//! - sender on the block list → rejected
//! - non-empty allow list without the sender → rejected
//!
//! Spam classification is a separate collaborator behind [`SpamClassifier`];
//! a positive verdict routes the message to quarantine instead of rejection.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::config::ProcessingPolicy;
use crate::ingest::model::{Direction, RejectReason};
use crate::mailbox::parse::FetchedMessage;

/// Whether `email` matches any sender pattern.
///
/// Patterns: `*` (anyone), `user@example.com` (exact, case-insensitive),
/// `@example.com` or `example.com` (domain).
pub fn sender_matches(patterns: &[String], email: &str) -> bool {
    if patterns.iter().any(|p| p == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    patterns.iter().any(|p| {
        if p.starts_with('@') {
            // "@example.com" → domain match
            email_lower.ends_with(&p.to_lowercase())
        } else if p.contains('@') {
            // "user@example.com" → exact email match
            p.eq_ignore_ascii_case(email)
        } else {
            // "example.com" → domain match
            email_lower.ends_with(&format!("@{}", p.to_lowercase()))
        }
    })
}

/// Size and sender checks derived from the processing policy.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    max_message_size: u64,
    allowed_senders: Vec<String>,
    blocked_senders: Vec<String>,
    own_addresses: Vec<String>,
}

impl PolicyGate {
    pub fn new(policy: &ProcessingPolicy) -> Self {
        Self {
            max_message_size: policy.max_message_size,
            allowed_senders: policy.allowed_senders.clone(),
            blocked_senders: policy.blocked_senders.clone(),
            own_addresses: policy.own_addresses.clone(),
        }
    }

    pub fn check_size(&self, size: u64) -> Result<(), RejectReason> {
        if size > self.max_message_size {
            return Err(RejectReason::Oversize {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    pub fn check_sender(&self, sender: Option<&str>) -> Result<(), RejectReason> {
        if let Some(sender) = sender
            && sender_matches(&self.blocked_senders, sender)
        {
            return Err(RejectReason::BlockedSender {
                sender: sender.to_string(),
            });
        }
        if self.allowed_senders.is_empty() {
            return Ok(());
        }
        match sender {
            Some(s) if sender_matches(&self.allowed_senders, s) => Ok(()),
            other => Err(RejectReason::SenderNotAllowed {
                sender: other.map(str::to_string),
            }),
        }
    }

    /// Size check first, then sender checks.
    pub fn evaluate(&self, msg: &FetchedMessage) -> Result<(), RejectReason> {
        self.check_size(msg.size.ok_or(RejectReason::SizeUnknown)?)?;
        self.check_sender(msg.envelope.from.as_deref())
    }

    /// Outgoing when the sender is one of the mailbox owner's addresses.
    pub fn direction(&self, sender: Option<&str>) -> Direction {
        match sender {
            Some(s) if !self.own_addresses.is_empty() && sender_matches(&self.own_addresses, s) => {
                Direction::Outgoing
            }
            _ => Direction::Incoming,
        }
    }
}

/// Spam verdict for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpamVerdict {
    Ham,
    Spam { reason: String },
}

/// Spam classification collaborator.
#[async_trait]
pub trait SpamClassifier: Send + Sync {
    async fn classify(&self, msg: &FetchedMessage) -> SpamVerdict;
}

/// Classifier that never flags anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClassifier;

#[async_trait]
impl SpamClassifier for NoopClassifier {
    async fn classify(&self, _msg: &FetchedMessage) -> SpamVerdict {
        SpamVerdict::Ham
    }
}

/// Which message field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
}

/// One spam rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct SpamRule {
    pub regex: Regex,
    pub field: RuleField,
    pub reason: String,
}

/// Only the start of the raw message is scanned by content rules.
const CONTENT_SCAN_LIMIT: usize = 64 * 1024;

/// Regex rules plus the upstream `X-Spam-Flag` header.
#[derive(Debug, Clone)]
pub struct RuleSpamClassifier {
    rules: Vec<SpamRule>,
    trust_spam_flag: bool,
}

impl RuleSpamClassifier {
    /// A classifier with a small set of common spam patterns.
    pub fn default_rules() -> Self {
        let rules = vec![
            SpamRule {
                regex: Regex::new(r"(?i)\b(viagra|cialis|casino|lottery winner)\b").unwrap(),
                field: RuleField::Subject,
                reason: "spam keywords in subject".into(),
            },
            SpamRule {
                regex: Regex::new(r"(?i)^\*+\s*spam\s*\*+").unwrap(),
                field: RuleField::Subject,
                reason: "subject tagged as spam upstream".into(),
            },
            SpamRule {
                regex: Regex::new(r"(?i)(you have won|claim your prize|wire transfer fee|100% free)")
                    .unwrap(),
                field: RuleField::Content,
                reason: "spam phrasing in body".into(),
            },
        ];
        Self {
            rules,
            trust_spam_flag: true,
        }
    }

    /// An empty classifier that only honours `X-Spam-Flag`.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            trust_spam_flag: true,
        }
    }

    pub fn with_rule(mut self, rule: SpamRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn check(&self, msg: &FetchedMessage) -> SpamVerdict {
        if self.trust_spam_flag
            && msg
                .envelope
                .spam_flag
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case("yes"))
        {
            return SpamVerdict::Spam {
                reason: "X-Spam-Flag: YES".into(),
            };
        }

        let content = String::from_utf8_lossy(&msg.raw[..msg.raw.len().min(CONTENT_SCAN_LIMIT)]);
        for rule in &self.rules {
            let haystack = match rule.field {
                RuleField::Sender => msg.envelope.from.as_deref().unwrap_or(""),
                RuleField::Subject => msg.envelope.subject.as_deref().unwrap_or(""),
                RuleField::Content => content.as_ref(),
            };
            if rule.regex.is_match(haystack) {
                debug!(uid = msg.uid, reason = %rule.reason, "Spam rule matched");
                return SpamVerdict::Spam {
                    reason: rule.reason.clone(),
                };
            }
        }
        SpamVerdict::Ham
    }
}

#[async_trait]
impl SpamClassifier for RuleSpamClassifier {
    async fn classify(&self, msg: &FetchedMessage) -> SpamVerdict {
        self.check(msg)
    }
}
