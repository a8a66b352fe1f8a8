//! Cursor search and chunked fetch.

use std::collections::HashSet;

use futures::Stream;
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::{IngestError, Phase};
use crate::governor::Governor;
use crate::mailbox::parse::{FetchedMessage, parse_record};
use crate::mailbox::session::Session;

/// One successfully retrieved chunk.
#[derive(Debug, Clone)]
pub struct FetchedChunk {
    pub index: usize,
    pub first_uid: u64,
    pub last_uid: u64,
    /// Parsed messages in ascending UID order.
    pub messages: Vec<FetchedMessage>,
    /// Requested UIDs the server returned nothing for (expunged meanwhile).
    pub missing: Vec<u64>,
    /// UIDs whose bytes could not be parsed as a message.
    pub unparseable: Vec<u64>,
}

/// Search and fetch bound to one cycle's session and governor.
#[derive(Clone)]
pub struct Pager<'a> {
    session: &'a Session,
    gov: &'a Governor,
    page_size: usize,
    include_body: bool,
}

impl<'a> Pager<'a> {
    pub fn new(session: &'a Session, gov: &'a Governor, poll: &PollConfig) -> Self {
        Self {
            session,
            gov,
            page_size: poll.page_size.max(1),
            include_body: poll.fetch_bodies,
        }
    }

    async fn reconnect_if_needed(&self) -> Result<(), IngestError> {
        if !self.session.is_connected() {
            debug!("Session dropped, reconnecting before next request");
            self.session.ensure_connected_once(self.gov).await?;
        }
        Ok(())
    }

    /// UIDs strictly greater than `since_uid`, ascending and deduplicated.
    ///
    /// The server's ordering is not trusted, and `n:*` ranges may echo back the
    /// highest existing UID even when it is below `n`.
    pub async fn search(&self, since_uid: u64) -> Result<Vec<u64>, IngestError> {
        let mut uids = self
            .gov
            .retry(Phase::Fetch, || async {
                self.reconnect_if_needed().await?;
                self.session.uid_search(self.gov, since_uid).await
            })
            .await?;
        uids.retain(|uid| *uid > since_uid);
        uids.sort_unstable();
        uids.dedup();
        debug!(since_uid, found = uids.len(), "Search complete");
        Ok(uids)
    }

    /// Lazily fetch `ids` in chunks of at most `page_size`.
    pub fn fetch_page(&self, ids: &[u64]) -> PageStream<'a> {
        PageStream {
            pager: self.clone(),
            chunks: chunk_ids(ids, self.page_size),
            next: 0,
            failed: false,
        }
    }

    async fn fetch_chunk(&self, index: usize, ids: &[u64]) -> Result<FetchedChunk, IngestError> {
        let (first_uid, last_uid) = match (ids.first(), ids.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => {
                return Ok(FetchedChunk {
                    index,
                    first_uid: 0,
                    last_uid: 0,
                    messages: Vec::new(),
                    missing: Vec::new(),
                    unparseable: Vec::new(),
                });
            }
        };
        let scope = |e: IngestError| match e {
            IngestError::Connection(reason) | IngestError::Protocol(reason) => IngestError::Fetch {
                chunk: index,
                first_uid,
                last_uid,
                reason,
            },
            other => other,
        };

        let records = self
            .gov
            .retry(Phase::Fetch, || async {
                self.reconnect_if_needed().await.map_err(&scope)?;
                self.session
                    .uid_fetch(self.gov, ids, self.include_body)
                    .await
                    .map_err(&scope)
            })
            .await?;

        let info = self.session.mailbox().unwrap_or_default();
        let wanted: HashSet<u64> = ids.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut messages = Vec::with_capacity(records.len());
        let mut unparseable = Vec::new();

        for record in records {
            let uid = record.uid;
            if !wanted.contains(&uid) || !seen.insert(uid) {
                continue;
            }
            match parse_record(record, &info.name, info.uid_validity, !self.include_body) {
                Some(msg) => messages.push(msg),
                None => {
                    warn!(uid, "Fetched record is not a parseable message");
                    unparseable.push(uid);
                }
            }
        }
        messages.sort_by_key(|m| m.uid);

        let missing: Vec<u64> = ids.iter().copied().filter(|uid| !seen.contains(uid)).collect();
        debug!(
            chunk = index,
            first_uid,
            last_uid,
            fetched = messages.len(),
            missing = missing.len(),
            "Chunk fetched"
        );

        Ok(FetchedChunk {
            index,
            first_uid,
            last_uid,
            messages,
            missing,
            unparseable,
        })
    }
}

/// Split ids into consecutive chunks of at most `size`.
pub fn chunk_ids(ids: &[u64], size: usize) -> Vec<Vec<u64>> {
    ids.chunks(size.max(1)).map(<[u64]>::to_vec).collect()
}

/// Finite, lazy sequence of chunks.
///
/// A failed chunk is not skipped: calling [`PageStream::next_chunk`] again
/// re-requests it. Delivered chunks are never emitted twice.
pub struct PageStream<'a> {
    pager: Pager<'a>,
    chunks: Vec<Vec<u64>>,
    next: usize,
    failed: bool,
}

impl<'a> PageStream<'a> {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub async fn next_chunk(&mut self) -> Option<Result<FetchedChunk, IngestError>> {
        let ids = self.chunks.get(self.next)?;
        let res = self.pager.fetch_chunk(self.next, ids).await;
        match &res {
            Ok(_) => {
                self.next += 1;
                self.failed = false;
            }
            Err(_) => self.failed = true,
        }
        Some(res)
    }

    /// Adapt into a `Stream` that ends after the first failed chunk.
    pub fn into_stream(self) -> impl Stream<Item = Result<FetchedChunk, IngestError>> + 'a {
        futures::stream::unfold(self, |mut page| async move {
            if page.failed {
                return None;
            }
            let item = page.next_chunk().await?;
            Some((item, page))
        })
    }
}
