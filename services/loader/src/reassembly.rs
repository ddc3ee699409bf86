//! Partial response reassembly.
//!
//! Byte-ranged responses for the same image arrive as separate chunks. Each
//! new chunk is appended to the chunks already received for that image and
//! the full concatenation is handed back for re-parsing. Re-parsing the
//! growing buffer on every arrival costs O(N²) bytes touched for N chunks,
//! which is fine for the handful of stages a retrieval plan has.
//!
//! Appends for one image are serialized through [`Ticket`]s: a ticket is
//! reserved when a request is issued and chunks are appended strictly in
//! reservation order, whatever order the responses complete in.

use crate::error::LoadError;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct Entry {
    chunks: Vec<Bytes>,
    next_ticket: u64,
    serving: u64,
    released: BTreeSet<u64>,
}

impl Entry {
    fn total_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    fn append(&mut self, chunk: Bytes) -> Bytes {
        if self.chunks.is_empty() {
            self.chunks.push(chunk.clone());
            return chunk;
        }

        let mut combined = BytesMut::with_capacity(self.total_len() + chunk.len());
        for prior in &self.chunks {
            combined.extend_from_slice(prior);
        }
        combined.extend_from_slice(&chunk);
        self.chunks.push(chunk);
        combined.freeze()
    }

    fn advance(&mut self) {
        self.serving += 1;
        while self.released.remove(&self.serving) {
            self.serving += 1;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    epoch: u64,
    entries: HashMap<String, Entry>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    turn: Notify,
}

/// Chunks received so far, keyed by image identifier
#[derive(Debug, Clone, Default)]
pub struct PartialBuffers {
    inner: Arc<Inner>,
}

impl PartialBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next append slot for `image_id`.
    pub fn reserve(&self, image_id: &str) -> Ticket {
        let mut state = self.inner.state.lock();
        let epoch = state.epoch;
        let entry = state.entries.entry(image_id.to_string()).or_default();
        let seq = entry.next_ticket;
        entry.next_ticket += 1;

        Ticket {
            buffers: self.inner.clone(),
            image_id: image_id.to_string(),
            seq,
            epoch,
            used: false,
        }
    }

    /// Append `chunk` after everything reserved before it and return the
    /// combined buffer.
    pub async fn accumulate(&self, image_id: &str, chunk: Bytes) -> Result<Bytes, LoadError> {
        self.reserve(image_id).accumulate(chunk).await
    }

    /// Drop every entry. Tickets issued before the purge fail with
    /// [`LoadError::Purged`].
    pub fn purge(&self) {
        {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let purged = state.entries.len();
            state.entries.clear();
            debug!(entries = purged, "Purged partial buffers");
        }
        self.inner.turn.notify_waiters();
    }

    pub fn chunk_count(&self, image_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .get(image_id)
            .map_or(0, |entry| entry.chunks.len())
    }

    pub fn total_len(&self, image_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .get(image_id)
            .map_or(0, Entry::total_len)
    }

    /// Number of images holding at least one chunk.
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.chunks.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reserved append slot for one image
///
/// Dropping an unused ticket gives its turn to the next one.
#[derive(Debug)]
pub struct Ticket {
    buffers: Arc<Inner>,
    image_id: String,
    seq: u64,
    epoch: u64,
    used: bool,
}

impl Ticket {
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Wait for this ticket's turn, append `chunk` and return the combined
    /// buffer.
    pub async fn accumulate(mut self, chunk: Bytes) -> Result<Bytes, LoadError> {
        loop {
            let notified = self.buffers.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.buffers.state.lock();
                if state.epoch != self.epoch {
                    self.used = true;
                    return Err(LoadError::Purged);
                }

                let entry = state.entries.entry(self.image_id.clone()).or_default();
                if entry.serving == self.seq {
                    let prior_chunks = entry.chunks.len();
                    let combined = entry.append(chunk);
                    entry.advance();
                    self.used = true;
                    drop(state);

                    if prior_chunks > 0 {
                        debug!(
                            image_id = %self.image_id,
                            chunks = prior_chunks + 1,
                            total_len = combined.len(),
                            "Combined prior partial responses"
                        );
                    }
                    self.buffers.turn.notify_waiters();
                    return Ok(combined);
                }
            }

            notified.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.used {
            return;
        }

        {
            let mut state = self.buffers.state.lock();
            if state.epoch != self.epoch {
                return;
            }
            if let Some(entry) = state.entries.get_mut(&self.image_id) {
                if entry.serving == self.seq {
                    entry.advance();
                } else {
                    entry.released.insert(self.seq);
                }
            }
        }
        self.buffers.turn.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[tokio::test]
    async fn test_first_chunk_returned_unchanged() {
        let buffers = PartialBuffers::new();
        let first = chunk(10, 1);
        let combined = buffers.accumulate("img", first.clone()).await.unwrap();
        assert_eq!(combined, first);
        assert_eq!(buffers.chunk_count("img"), 1);
    }

    #[tokio::test]
    async fn test_three_chunks_concatenate_in_order() {
        let buffers = PartialBuffers::new();
        let a = chunk(100, 0xa);
        let b = chunk(50, 0xb);
        let c = chunk(200, 0xc);

        buffers.accumulate("img", a.clone()).await.unwrap();
        buffers.accumulate("img", b.clone()).await.unwrap();
        let combined = buffers.accumulate("img", c.clone()).await.unwrap();

        let mut expected = a.to_vec();
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);
        assert_eq!(combined.len(), 350);
        assert_eq!(combined.as_ref(), expected.as_slice());
        assert_eq!(buffers.total_len("img"), 350);
        assert_eq!(buffers.chunk_count("img"), 3);
    }

    #[tokio::test]
    async fn test_images_are_independent() {
        let buffers = PartialBuffers::new();
        buffers.accumulate("a", chunk(4, 1)).await.unwrap();
        let other = buffers.accumulate("b", chunk(2, 2)).await.unwrap();
        assert_eq!(other.len(), 2);
        assert_eq!(buffers.len(), 2);
    }

    #[tokio::test]
    async fn test_appends_follow_reservation_order() {
        let buffers = PartialBuffers::new();
        let first = buffers.reserve("img");
        let second = buffers.reserve("img");

        let late = tokio::spawn(second.accumulate(chunk(3, 2)));
        tokio::task::yield_now().await;
        assert!(!late.is_finished());

        let early = first.accumulate(chunk(2, 1)).await.unwrap();
        assert_eq!(early.as_ref(), &[1, 1]);

        let combined = late.await.unwrap().unwrap();
        assert_eq!(combined.as_ref(), &[1, 1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_turn() {
        let buffers = PartialBuffers::new();
        let skipped = buffers.reserve("img");
        let next = buffers.reserve("img");
        drop(skipped);

        let combined = next.accumulate(chunk(5, 9)).await.unwrap();
        assert_eq!(combined.len(), 5);
    }

    #[tokio::test]
    async fn test_purge_clears_and_invalidates_tickets() {
        let buffers = PartialBuffers::new();
        buffers.accumulate("img", chunk(8, 1)).await.unwrap();
        let stale = buffers.reserve("img");

        buffers.purge();
        assert!(buffers.is_empty());
        assert!(matches!(
            stale.accumulate(chunk(1, 1)).await,
            Err(LoadError::Purged)
        ));

        let fresh = buffers.accumulate("img", chunk(3, 3)).await.unwrap();
        assert_eq!(fresh.len(), 3);
    }
}
