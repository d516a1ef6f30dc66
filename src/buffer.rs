//! Pending outbound chunks.
//!
//! ```text
//!   writers ──push──▶ [ c3 | c2 | c1 ] ──pop──▶ head (owned by the DrainGuard)
//! ```
//!
//! Appends never take the drain lock, so a writer that lost the race for the
//! socket can still queue its chunk and return. Only the guard holder pops.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam_queue::SegQueue;

pub struct WriteBuffer {
    queue: SegQueue<Bytes>,
    chunks: AtomicUsize,
    bytes: AtomicUsize,
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            chunks: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }

    /// Appends a chunk at the tail. Safe to call from any thread.
    pub fn push(&self, chunk: Bytes) {
        // counted before the chunk becomes visible so `is_empty` never
        // reports empty while a chunk sits in the queue
        self.chunks.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(chunk.len(), Ordering::SeqCst);
        self.queue.push(chunk);
    }

    /// Removes the oldest chunk.
    pub fn pop(&self) -> Option<Bytes> {
        let chunk = self.queue.pop()?;
        self.bytes.fetch_sub(chunk.len(), Ordering::SeqCst);
        self.chunks.fetch_sub(1, Ordering::SeqCst);
        Some(chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.load(Ordering::SeqCst) == 0
    }

    pub fn len(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    /// Bytes queued, not counting the head chunk.
    pub fn queued_bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Drops every queued chunk and returns how many bytes were discarded.
    pub fn clear(&self) -> usize {
        let mut discarded = 0;
        while let Some(chunk) = self.pop() {
            discarded += chunk.len();
        }
        discarded
    }
}
