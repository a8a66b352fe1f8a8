//! Raw fetch records to envelopes and bodies, via `mail-parser`.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

use crate::mailbox::transport::RawMessage;

/// Header-level metadata of a message. Immutable once read from the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Normalized `Message-ID`, or a synthetic id when the header is absent.
    pub protocol_message_id: String,
    /// `true` when `protocol_message_id` was derived locally.
    #[serde(default)]
    pub synthetic_id: bool,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Raw `X-Spam-Flag` header, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spam_flag: Option<String>,
}

/// A fetched message: envelope plus the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u64,
    /// Server-reported size. A full fetch falls back to the fetched byte
    /// count; a headers-only fetch without a reported size leaves it unknown.
    pub size: Option<u64>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub envelope: Envelope,
    pub raw: Vec<u8>,
    pub headers_only: bool,
}

/// File attached to a message. Contents are not retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: usize,
}

/// Readable parts of a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

/// Strip surrounding angle brackets and whitespace from a message id.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Stable id for a message without a `Message-ID` header.
pub fn synthetic_message_id(mailbox: &str, uid_validity: Option<u32>, uid: u64) -> String {
    format!(
        "synthetic.{}.{}.{uid}@mail-ingest",
        mailbox.to_lowercase().replace(char::is_whitespace, "_"),
        uid_validity.unwrap_or(0)
    )
}

/// Turn a raw record into a `FetchedMessage`.
///
/// Returns `None` when the bytes are not a parseable message at all.
pub fn parse_record(
    raw: RawMessage,
    mailbox: &str,
    uid_validity: Option<u32>,
    headers_only: bool,
) -> Option<FetchedMessage> {
    let parsed = MessageParser::default().parse(&raw.data)?;

    let (protocol_message_id, synthetic_id) = match parsed.message_id().and_then(normalize_message_id)
    {
        Some(id) => (id, false),
        None => (synthetic_message_id(mailbox, uid_validity, raw.uid), true),
    };

    let envelope = Envelope {
        protocol_message_id,
        synthetic_id,
        in_reply_to: text_values(parsed.in_reply_to()).into_iter().next(),
        references: text_values(parsed.references()),
        from: parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string()),
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        subject: parsed.subject().map(|s| s.to_string()),
        date: parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        spam_flag: parsed.header_raw("X-Spam-Flag").map(|s| s.trim().to_string()),
    };

    Some(FetchedMessage {
        uid: raw.uid,
        size: raw
            .size
            .or((!headers_only).then_some(raw.data.len() as u64)),
        flags: raw.flags,
        internal_date: raw.internal_date,
        envelope,
        raw: raw.data,
        headers_only,
    })
}

/// Message ids listed in an `In-Reply-To` / `References` header, in order.
fn text_values(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(t) => t.split_whitespace().filter_map(normalize_message_id).collect(),
        HeaderValue::TextList(list) => list
            .iter()
            .flat_map(|t| t.split_whitespace())
            .filter_map(normalize_message_id)
            .collect(),
        _ => Vec::new(),
    }
}

/// Extract addresses from a parsed address header.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Text, HTML and attachment metadata of a message body.
pub fn extract_content(raw: &[u8]) -> MessageContent {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return MessageContent::default();
    };

    let html = parsed.body_html(0).map(|h| h.to_string());
    let text = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| html.as_deref().map(strip_html))
        .filter(|t| !t.trim().is_empty());

    let attachments = parsed
        .attachments()
        .map(|part| {
            let part: &mail_parser::MessagePart = part;
            AttachmentMeta {
                filename: MimeHeaders::attachment_name(part).map(|s| s.to_string()),
                content_type: MimeHeaders::content_type(part).map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                }),
                size: part.contents().len(),
            }
        })
        .collect();

    MessageContent {
        text,
        html,
        attachments,
    }
}

/// Very basic HTML tag stripping.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
