// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size- and age-bounded accumulation of documents into batches.
//!
//! The open batch lives behind a single mutex. Whichever of `append`,
//! `seal_due`, `take` or `close` observes a sealing condition swaps the open
//! batch for an empty one while holding the lock, so each document ends up in
//! exactly one sealed [`Batch`]. The lock is never held across an `.await`.

use crate::batch::{Batch, Document, SealReason};
use std::mem;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Returned by [`BatchBuffer::append`] once the buffer has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("batch buffer is closed")]
pub struct BufferClosed;

#[derive(Debug, Default)]
struct OpenBatch {
    documents: Vec<Document>,
    size_bytes: usize,
    opened_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct BufferState {
    open: OpenBatch,
    next_id: u64,
    closed: bool,
}

impl BufferState {
    fn seal(&mut self, reason: SealReason) -> Option<Batch> {
        if self.open.documents.is_empty() {
            return None;
        }
        let open = mem::take(&mut self.open);
        let id = self.next_id;
        self.next_id += 1;
        Some(Batch::new(
            id,
            open.documents,
            open.size_bytes,
            open.opened_at.unwrap_or_else(Instant::now),
            reason,
        ))
    }
}

#[derive(Debug)]
pub struct BatchBuffer {
    state: Mutex<BufferState>,
    flush_bytes: usize,
    flush_interval: Duration,
    /// Bytes each document adds to the payload besides its body: the action
    /// line and two newlines.
    item_overhead: usize,
    /// Signalled when a document lands in an empty batch.
    opened: Notify,
}

impl BatchBuffer {
    #[must_use]
    pub fn new(flush_bytes: usize, flush_interval: Duration, item_overhead: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            flush_bytes,
            flush_interval,
            item_overhead,
            opened: Notify::new(),
        }
    }

    /// Wire size of `doc` in the bulk payload.
    #[must_use]
    pub fn wire_size(&self, doc: &Document) -> usize {
        doc.len() + self.item_overhead
    }

    /// Adds `doc` to the open batch, sealing it when the byte threshold is
    /// reached.
    #[allow(clippy::expect_used)]
    pub fn append(&self, doc: Document) -> Result<Option<Batch>, BufferClosed> {
        let size = self.wire_size(&doc);
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(BufferClosed);
        }

        let first = state.open.documents.is_empty();
        if first {
            state.open.opened_at = Some(Instant::now());
        }
        state.open.documents.push(doc);
        state.open.size_bytes += size;

        let sealed = if state.open.size_bytes >= self.flush_bytes {
            state.seal(SealReason::Size)
        } else {
            None
        };
        drop(state);

        if first && sealed.is_none() {
            self.opened.notify_one();
        }
        Ok(sealed)
    }

    /// When the open batch becomes due, or `None` while it is empty.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.state.lock().expect("lock poisoned");
        state.open.opened_at.map(|opened| opened + self.flush_interval)
    }

    /// Seals the open batch if its first document is at least
    /// `flush_interval` old at `now`.
    #[allow(clippy::expect_used)]
    pub fn seal_due(&self, now: Instant) -> Option<Batch> {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.open.opened_at {
            Some(opened) if now.duration_since(opened) >= self.flush_interval => {
                state.seal(SealReason::Interval)
            }
            _ => None,
        }
    }

    /// Seals whatever is open, regardless of thresholds.
    #[allow(clippy::expect_used)]
    pub fn take(&self, reason: SealReason) -> Option<Batch> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.seal(reason)
    }

    /// Seals whatever is open and refuses later appends. Closing twice
    /// returns `None` the second time.
    #[allow(clippy::expect_used)]
    pub fn close(&self) -> Option<Batch> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.closed = true;
        let sealed = state.seal(SealReason::Close);
        drop(state);
        self.opened.notify_waiters();
        sealed
    }

    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("lock poisoned").closed
    }

    /// Completes once a document has been appended to an empty batch.
    ///
    /// A notification sent while nobody waits is kept, so an append racing
    /// with the timer going idle is not missed.
    pub async fn wait_for_documents(&self) {
        self.opened.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(len: usize) -> Document {
        Document::new(vec![b'x'; len])
    }

    #[test]
    fn test_append_below_threshold() {
        let buffer = BatchBuffer::new(100, Duration::from_secs(5), 10);
        assert!(buffer.append(doc(20)).expect("append").is_none());
        assert!(buffer.append(doc(20)).expect("append").is_none());
        assert!(buffer.deadline().is_some());
    }

    #[test]
    fn test_append_seals_at_threshold() {
        let buffer = BatchBuffer::new(60, Duration::from_secs(5), 10);
        assert!(buffer.append(doc(20)).expect("append").is_none());
        let batch = buffer
            .append(doc(20))
            .expect("append")
            .expect("batch should seal");

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), 60);
        assert_eq!(batch.reason(), SealReason::Size);
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn test_oversized_document_seals_alone() {
        let buffer = BatchBuffer::new(10, Duration::from_secs(5), 2);
        let batch = buffer
            .append(doc(50))
            .expect("append")
            .expect("batch should seal");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.id(), 0);
    }

    #[test]
    fn test_batch_ids_increase() {
        let buffer = BatchBuffer::new(1, Duration::from_secs(5), 0);
        let first = buffer.append(doc(1)).expect("append").expect("sealed");
        let second = buffer.append(doc(1)).expect("append").expect("sealed");
        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
    }

    #[test]
    fn test_documents_keep_append_order() {
        let buffer = BatchBuffer::new(1_000, Duration::from_secs(5), 0);
        for i in 0..5u8 {
            buffer
                .append(Document::new(vec![i]))
                .expect("append");
        }
        let batch = buffer.take(SealReason::Flush).expect("batch");
        let bytes: Vec<u8> = batch.documents().iter().map(|d| d.as_bytes()[0]).collect();
        assert_eq!(bytes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seal_due_respects_interval() {
        let buffer = BatchBuffer::new(1_000, Duration::from_millis(50), 0);
        assert!(buffer.seal_due(Instant::now()).is_none());

        buffer.append(doc(5)).expect("append");
        assert!(buffer.seal_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(30)).await;
        buffer.append(doc(5)).expect("append");
        assert!(buffer.seal_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(20)).await;
        let batch = buffer.seal_due(Instant::now()).expect("batch is due");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.reason(), SealReason::Interval);
        assert!(buffer.seal_due(Instant::now()).is_none());
    }

    #[test]
    fn test_take_empty_is_none() {
        let buffer = BatchBuffer::new(100, Duration::from_secs(5), 0);
        assert!(buffer.take(SealReason::Flush).is_none());
    }

    #[test]
    fn test_close_seals_remaining_and_refuses_appends() {
        let buffer = BatchBuffer::new(1_000, Duration::from_secs(5), 0);
        buffer.append(doc(1)).expect("append");

        let batch = buffer.close().expect("remaining batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.reason(), SealReason::Close);
        assert!(buffer.is_closed());
        assert_eq!(buffer.append(doc(1)).unwrap_err(), BufferClosed);
        assert!(buffer.close().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_documents_after_append() {
        let buffer = BatchBuffer::new(1_000, Duration::from_secs(5), 0);
        buffer.append(doc(1)).expect("append");
        tokio::time::timeout(Duration::from_millis(100), buffer.wait_for_documents())
            .await
            .expect("notification should be stored");
    }
}
