// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent delivery of sealed batches.
//!
//! A fixed pool of workers shares one bounded queue. Each worker takes a
//! batch, sends it through the [`BulkTransport`] (retrying the whole batch on
//! transient failures) and folds the per-document outcomes into [`Stats`].
//! Batches may complete out of submission order.

use crate::batch::Batch;
use crate::config::RetryStrategy;
use crate::errors::PipelineError;
use crate::stats::Stats;
use crate::transport::{BulkTransport, ItemResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Final result of delivering one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Created,
    Failed(String),
}

/// Everything a worker learned while delivering one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: u64,
    /// Bulk requests sent for the batch
    pub attempts: u64,
    /// One entry per document, in batch order.
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BatchReport {
    /// Times the whole batch was sent again after a transient failure.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.attempts.saturating_sub(1)
    }
}

/// Sending half of the delivery queue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<Batch>,
    /// Batches submitted but not yet reported.
    pending: Arc<watch::Sender<usize>>,
    closing: CancellationToken,
}

impl DeliveryQueue {
    /// Enqueues a sealed batch, waiting while the queue is full.
    pub async fn submit(&self, batch: Batch) -> Result<(), PipelineError> {
        match self.reserve().await {
            Ok(slot) => {
                slot.send(batch);
                Ok(())
            }
            Err(e) => {
                error!(
                    "LOGSERVICE | Dropping batch {} of {} documents: delivery is closed",
                    batch.id(),
                    batch.len()
                );
                Err(e)
            }
        }
    }

    /// Waits for room in the queue. Dropping the slot unused releases it.
    /// Fails with `QueueClosed` once the pool starts closing, including for
    /// callers already waiting.
    ///
    /// Reserving before sealing lets callers give up on a full queue without
    /// holding a batch they would have to discard.
    pub async fn reserve(&self) -> Result<QueueSlot<'_>, PipelineError> {
        if self.closing.is_cancelled() {
            return Err(PipelineError::QueueClosed);
        }
        let permit = tokio::select! {
            permit = self.tx.reserve() => permit.map_err(|_| PipelineError::QueueClosed)?,
            () = self.closing.cancelled() => return Err(PipelineError::QueueClosed),
        };
        Ok(QueueSlot {
            permit,
            pending: self.pending.as_ref(),
        })
    }

    /// Completes once every submitted batch has been reported.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so this only ends when the count is 0.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }
}

/// Reserved capacity in the delivery queue.
pub struct QueueSlot<'a> {
    permit: mpsc::Permit<'a, Batch>,
    pending: &'a watch::Sender<usize>,
}

impl QueueSlot<'_> {
    pub fn send(self, batch: Batch) {
        debug!(
            "LOGSERVICE | Submitting batch {} with {} documents ({} bytes, {:?})",
            batch.id(),
            batch.len(),
            batch.size_bytes(),
            batch.reason()
        );
        self.pending.send_modify(|pending| *pending += 1);
        self.permit.send(batch);
    }
}

/// Owner of the delivery workers.
#[derive(Debug)]
pub struct DeliveryPool {
    queue: DeliveryQueue,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl DeliveryPool {
    /// Spawns `num_workers` workers on the current runtime.
    #[must_use]
    pub fn start(
        transport: Arc<dyn BulkTransport>,
        stats: Arc<Stats>,
        num_workers: usize,
        queue_capacity: usize,
        retry_strategy: RetryStrategy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let (pending, _) = watch::channel(0usize);
        let queue = DeliveryQueue {
            tx,
            pending: Arc::new(pending),
            closing: CancellationToken::new(),
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..num_workers.max(1) {
            let worker = Worker {
                id: worker_id,
                rx: Arc::clone(&rx),
                transport: Arc::clone(&transport),
                stats: Arc::clone(&stats),
                pending: Arc::clone(&queue.pending),
                closing: queue.closing.clone(),
                retry_strategy: retry_strategy.clone(),
            };
            workers.spawn(worker.run());
        }

        Self {
            queue,
            workers: Mutex::new(Some(workers)),
        }
    }

    #[must_use]
    pub fn queue(&self) -> DeliveryQueue {
        self.queue.clone()
    }

    /// Stops accepting batches and waits for queued and in-flight batches.
    ///
    /// Workers still running at the deadline are aborted. Calling `close`
    /// again after it returned is a no-op.
    pub async fn close(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.queue.closing.cancel();
        let Some(mut workers) = self.workers.lock().await.take() else {
            return Ok(());
        };

        let join_all = async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("LOGSERVICE | Delivery worker failed: {e}");
                }
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            error!(
                "LOGSERVICE | Delivery did not finish within {}ms, {} batches abandoned",
                timeout.as_millis(),
                self.queue.pending()
            );
            workers.abort_all();
            return Err(PipelineError::ShutdownTimeout);
        }
        Ok(())
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.queue.closing.cancel();
    }
}

struct Worker {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    transport: Arc<dyn BulkTransport>,
    stats: Arc<Stats>,
    pending: Arc<watch::Sender<usize>>,
    closing: CancellationToken,
    retry_strategy: RetryStrategy,
}

impl Worker {
    async fn run(self) {
        loop {
            let batch = {
                let mut rx = self.rx.lock().await;
                let received = tokio::select! {
                    biased;
                    batch = rx.recv() => Some(batch),
                    () = self.closing.cancelled() => None,
                };
                match received {
                    Some(batch) => batch,
                    // Closing: drain what is already queued, then stop.
                    None => rx.try_recv().ok(),
                }
            };
            let Some(batch) = batch else {
                debug!("LOGSERVICE | Delivery worker {} stopped", self.id);
                return;
            };

            let report = deliver(self.transport.as_ref(), &batch, &self.retry_strategy).await;
            self.stats.record_report(&report);
            self.pending
                .send_modify(|pending| *pending = pending.saturating_sub(1));
        }
    }
}

/// Sends `batch` until it succeeds, fails permanently, or runs out of
/// retries. Never fails itself: every document gets an outcome.
pub async fn deliver(
    transport: &dyn BulkTransport,
    batch: &Batch,
    retry_strategy: &RetryStrategy,
) -> BatchReport {
    let mut outcomes = Vec::with_capacity(batch.len());
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        match transport.bulk(batch).await {
            Ok(results) => {
                if results.len() != batch.len() {
                    warn!(
                        "LOGSERVICE | Bulk response for batch {} has {} items, expected {}",
                        batch.id(),
                        results.len(),
                        batch.len()
                    );
                }
                let mut results = results.into_iter();
                for _ in batch.documents() {
                    match results.next() {
                        Some(ItemResult::Created) => outcomes.push(DeliveryOutcome::Created),
                        Some(ItemResult::Failed(item_error)) => {
                            error!("LOGSERVICE | Indexing item: {item_error}");
                            outcomes.push(DeliveryOutcome::Failed(item_error.to_string()));
                        }
                        None => outcomes.push(DeliveryOutcome::Failed(
                            "missing from bulk response".to_string(),
                        )),
                    }
                }
                break;
            }
            Err(e) if e.is_transient() && attempts <= retry_strategy.max_retries() => {
                debug!(
                    "LOGSERVICE | Retrying batch {} after attempt {attempts}: {e}",
                    batch.id()
                );
                tokio::time::sleep(retry_strategy.delay(attempts)).await;
            }
            Err(e) => {
                error!(
                    "LOGSERVICE | Failed to deliver batch {} of {} documents after {attempts} attempts: {e}",
                    batch.id(),
                    batch.len()
                );
                let reason = e.to_string();
                outcomes.extend(
                    batch
                        .documents()
                        .iter()
                        .map(|_| DeliveryOutcome::Failed(reason.clone())),
                );
                break;
            }
        }
    }

    BatchReport {
        batch_id: batch.id(),
        attempts,
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Document, SealReason};
    use crate::test_support::ScriptedTransport;
    use crate::transport::{ItemError, TransportError};
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn batch(id: u64, docs: usize) -> Batch {
        let documents = (0..docs)
            .map(|i| Document::new(format!(r#"{{"n":{i}}}"#).into_bytes()))
            .collect();
        Batch::new(id, documents, 0, Instant::now(), SealReason::Flush)
    }

    fn unavailable() -> TransportError {
        TransportError::Status {
            status: 503,
            body: "unavailable".to_string(),
        }
    }

    fn count(report: &BatchReport, wanted: fn(&DeliveryOutcome) -> bool) -> usize {
        report.outcomes.iter().filter(|o| wanted(o)).count()
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let transport = ScriptedTransport::succeeding();
        let report = deliver(&transport, &batch(1, 3), &RetryStrategy::Immediate(3)).await;

        assert_eq!(report.batch_id, 1);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcomes, vec![DeliveryOutcome::Created; 3]);
    }

    #[tokio::test]
    async fn test_deliver_retries_transient_failures() {
        let transport = ScriptedTransport::new(vec![Err(unavailable()), Err(unavailable())]);
        let report = deliver(&transport, &batch(1, 2), &RetryStrategy::Immediate(5)).await;

        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries(), 2);
        assert_eq!(transport.calls(), 3);
        assert_eq!(report.outcomes, vec![DeliveryOutcome::Created; 2]);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_max_retries() {
        let transport = ScriptedTransport::new(vec![
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
            Err(unavailable()),
        ]);
        let report = deliver(&transport, &batch(1, 2), &RetryStrategy::Immediate(2)).await;

        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries(), 2);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(count(&report, |o| matches!(o, DeliveryOutcome::Failed(_))), 2);
    }

    #[tokio::test]
    async fn test_deliver_does_not_retry_permanent_failures() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Status {
            status: 400,
            body: "bad request".to_string(),
        })]);
        let report = deliver(&transport, &batch(1, 2), &RetryStrategy::Immediate(5)).await;

        assert_eq!(report.attempts, 1);
        assert_eq!(count(&report, |o| matches!(o, DeliveryOutcome::Failed(_))), 2);
    }

    #[tokio::test]
    async fn test_deliver_partial_failure() {
        let transport = ScriptedTransport::new(vec![Ok(vec![
            ItemResult::Created,
            ItemResult::Failed(ItemError::new("mapper_parsing_exception", "bad field")),
            ItemResult::Created,
        ])]);
        let report = deliver(&transport, &batch(1, 3), &RetryStrategy::Immediate(5)).await;

        assert_eq!(report.attempts, 1);
        assert_eq!(
            report.outcomes,
            vec![
                DeliveryOutcome::Created,
                DeliveryOutcome::Failed("mapper_parsing_exception: bad field".to_string()),
                DeliveryOutcome::Created,
            ]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_deliver_logs_item_failure_cause() {
        let transport = ScriptedTransport::new(vec![Ok(vec![ItemResult::Failed(ItemError {
            error_type: "mapper_parsing_exception".to_string(),
            reason: "failed to parse field [message]".to_string(),
            caused_by: Some(crate::transport::ErrorCause {
                error_type: "illegal_argument_exception".to_string(),
                reason: "bad value".to_string(),
            }),
        })])]);
        deliver(&transport, &batch(1, 1), &RetryStrategy::Immediate(0)).await;

        assert!(logs_contain(
            "Indexing item: illegal_argument_exception: bad value: failed to parse field [message]"
        ));
    }

    #[tokio::test]
    async fn test_deliver_short_response_fails_missing_items() {
        let transport = ScriptedTransport::new(vec![Ok(vec![ItemResult::Created])]);
        let report = deliver(&transport, &batch(1, 3), &RetryStrategy::Immediate(5)).await;

        assert_eq!(count(&report, |o| *o == DeliveryOutcome::Created), 1);
        assert_eq!(count(&report, |o| matches!(o, DeliveryOutcome::Failed(_))), 2);
    }

    #[tokio::test]
    async fn test_pool_delivers_queued_batches_before_close() {
        let transport = Arc::new(ScriptedTransport::succeeding());
        let stats = Arc::new(Stats::new());
        let pool = DeliveryPool::start(
            transport.clone(),
            Arc::clone(&stats),
            2,
            8,
            RetryStrategy::Immediate(0),
        );

        let queue = pool.queue();
        for id in 0..5 {
            queue.submit(batch(id, 2)).await.expect("submit");
        }
        pool.close(Duration::from_secs(5)).await.expect("close");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.created, 10);
        assert_eq!(snapshot.requests, 5);
        assert_eq!(queue.pending(), 0);
        assert!(matches!(
            queue.submit(batch(9, 1)).await,
            Err(PipelineError::QueueClosed)
        ));
        pool.close(Duration::from_secs(1)).await.expect("second close");
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let transport = Arc::new(ScriptedTransport::succeeding());
        let stats = Arc::new(Stats::new());
        let pool = DeliveryPool::start(
            transport,
            Arc::clone(&stats),
            1,
            4,
            RetryStrategy::Immediate(0),
        );
        let queue = pool.queue();

        queue.submit(batch(0, 4)).await.expect("submit");
        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue should drain");
        assert_eq!(stats.snapshot().created, 4);
    }

    #[tokio::test]
    async fn test_close_releases_blocked_submit() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let stats = Arc::new(Stats::new());
        let pool = DeliveryPool::start(transport, stats, 1, 1, RetryStrategy::Immediate(0));

        let queue = pool.queue();
        queue.submit(batch(0, 1)).await.expect("submit");
        queue.submit(batch(1, 1)).await.expect("submit");
        let blocked = tokio::spawn(async move { queue.submit(batch(2, 1)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let result = pool.close(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PipelineError::ShutdownTimeout)));
        let submitted = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked submit was not released")
            .expect("submit task panicked");
        assert!(matches!(submitted, Err(PipelineError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_close_times_out_on_stuck_transport() {
        let transport = Arc::new(ScriptedTransport::hanging());
        let stats = Arc::new(Stats::new());
        let pool = DeliveryPool::start(transport, stats, 1, 4, RetryStrategy::Immediate(0));

        pool.queue().submit(batch(0, 1)).await.expect("submit");
        let result = pool.close(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PipelineError::ShutdownTimeout)));
    }
}
