//! Thread resolution over `In-Reply-To` / `References`.

use std::collections::{HashMap, HashSet};

use crate::mailbox::parse::Envelope;

/// Ancestor ids in lookup order: `In-Reply-To`, then `References` as declared.
///
/// Duplicates and the message's own id are dropped.
pub fn thread_candidates(envelope: &Envelope) -> Vec<String> {
    let mut seen = HashSet::new();
    seen.insert(envelope.protocol_message_id.as_str());
    let mut out = Vec::new();
    for id in envelope
        .in_reply_to
        .iter()
        .chain(envelope.references.iter())
    {
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    out
}

/// Thread id for `envelope` given known `protocol id → thread id` links.
///
/// The first candidate with a known thread wins; without one the message
/// starts a thread named after its own protocol id.
pub fn resolve_thread(envelope: &Envelope, known: &HashMap<String, String>) -> String {
    thread_candidates(envelope)
        .iter()
        .find_map(|id| known.get(id))
        .cloned()
        .unwrap_or_else(|| envelope.protocol_message_id.clone())
}
