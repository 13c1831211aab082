// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingestion pipeline: filter, transform, buffer, deliver.
//!
//! ```text
//!   ingest(record)
//!       │
//!       v
//!   EntryFilter ──reject──> Ok(0)
//!       │
//!       v
//!   EntryTransformer ──error──> Err(Transform)
//!       │
//!       v
//!   BatchBuffer <── timer task (seals by age)
//!       │ sealed batches
//!       v
//!   DeliveryQueue ──> DeliveryPool workers ──> BulkTransport
//! ```
//!
//! Shutdown raises a flag first, so every `ingest` that starts afterwards is
//! rejected with [`PipelineError::ShuttingDown`]. Ingestion holds a read lock
//! on the gate for the whole call and shutdown then takes the write lock, so
//! records already in flight land in the buffer before it is drained. If they
//! cannot finish by the deadline, shutdown goes on without them and reports
//! what it dropped.

use crate::batch::SealReason;
use crate::buffer::BatchBuffer;
use crate::config::Config;
use crate::delivery::{DeliveryPool, DeliveryQueue};
use crate::errors::PipelineError;
use crate::filter::EntryFilter;
use crate::stats::{Stats, StatsSnapshot};
use crate::transform::EntryTransformer;
use crate::transport::{action_line, BulkTransport, ElasticsearchTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Pipeline {
    filter: EntryFilter,
    transformer: EntryTransformer,
    buffer: Arc<BatchBuffer>,
    pool: DeliveryPool,
    queue: DeliveryQueue,
    stats: Arc<Stats>,
    /// Set once shutdown has begun.
    closing: AtomicBool,
    /// Held shared by `ingest` and `flush`, exclusively by `shutdown`.
    gate: RwLock<()>,
    timer_cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Builds a pipeline that delivers to the Elasticsearch cluster named in
    /// `config`. Must be called from within a tokio runtime.
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let transport = ElasticsearchTransport::new(config)?;
        debug!("LOGSERVICE | Delivering to {}", transport.url());
        Self::with_transport(config, Arc::new(transport))
    }

    /// Builds a pipeline around an existing transport. The endpoint settings
    /// in `config` are ignored. Must be called from within a tokio runtime.
    pub fn with_transport(
        config: &Config,
        transport: Arc<dyn BulkTransport>,
    ) -> Result<Self, PipelineError> {
        config.validate_pipeline()?;

        let stats = Arc::new(Stats::new());
        let item_overhead = action_line(&config.index_name).len() + 2;
        let buffer = Arc::new(BatchBuffer::new(
            config.flush_bytes,
            config.flush_interval,
            item_overhead,
        ));
        let pool = DeliveryPool::start(
            transport,
            Arc::clone(&stats),
            config.num_workers,
            config.queue_capacity,
            config.retry_strategy.clone(),
        );
        let queue = pool.queue();

        let timer_cancel = CancellationToken::new();
        let timer = tokio::spawn(run_flush_timer(
            Arc::clone(&buffer),
            queue.clone(),
            config.flush_interval,
            timer_cancel.clone(),
        ));

        let filter = EntryFilter::new(config.valid_sources.iter().cloned());
        info!(
            "LOGSERVICE | Pipeline started: index={} sources={:?} flush_bytes={} flush_interval={}ms workers={}",
            config.index_name,
            filter.sources(),
            config.flush_bytes,
            config.flush_interval.as_millis(),
            config.num_workers
        );

        Ok(Self {
            filter,
            transformer: EntryTransformer::new(),
            buffer,
            pool,
            queue,
            stats,
            closing: AtomicBool::new(false),
            gate: RwLock::new(()),
            timer_cancel,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Accepts one raw record.
    ///
    /// Returns the number of bytes accepted: `record.len()` when the record
    /// was buffered, `0` when the filter dropped it. Waits while the delivery
    /// queue is full.
    pub async fn ingest(&self, record: &[u8]) -> Result<usize, PipelineError> {
        if self.is_closing() {
            return Err(PipelineError::ShuttingDown);
        }
        let gate = self.gate.read().await;
        if self.is_closing() {
            return Err(PipelineError::ShuttingDown);
        }

        if !self.filter.admit(record) {
            return Ok(0);
        }

        let doc = self.transformer.transform(record)?;
        let sealed = self
            .buffer
            .append(doc)
            .map_err(|_| PipelineError::ShuttingDown)?;
        self.stats.record_added();

        if let Some(batch) = sealed {
            self.queue.submit(batch).await?;
        }
        drop(gate);

        Ok(record.len())
    }

    /// Seals the open batch and waits until every batch submitted so far has
    /// been delivered. Ingestion continues meanwhile.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PipelineError> {
        let deadline = Instant::now() + timeout;
        {
            if self.is_closing() {
                return Err(PipelineError::ShuttingDown);
            }
            let _gate = self.gate.read().await;
            if self.is_closing() {
                return Err(PipelineError::ShuttingDown);
            }
            let slot = timeout_at(deadline, self.queue.reserve())
                .await
                .map_err(|_| PipelineError::FlushTimeout)??;
            if let Some(batch) = self.buffer.take(SealReason::Flush) {
                slot.send(batch);
            }
        }

        timeout_at(deadline, self.queue.wait_idle())
            .await
            .map_err(|_| PipelineError::FlushTimeout)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stops accepting records, drains the buffer and waits for delivery to
    /// finish within `timeout`.
    ///
    /// Every step runs even when an earlier one hit the deadline, so the
    /// pipeline is closed when this returns either way. Calling it again
    /// returns `Ok(())` without doing anything.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("LOGSERVICE | Shutdown already requested");
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        info!("LOGSERVICE | Shutting down, draining buffered documents");

        let quiesced = match timeout_at(deadline, self.gate.write()).await {
            Ok(_gate) => Ok(()),
            Err(_) => {
                error!("LOGSERVICE | Timed out waiting for in-flight ingestion to finish");
                Err(PipelineError::ShutdownTimeout)
            }
        };

        self.timer_cancel.cancel();
        if let Some(mut timer) = self.timer.lock().await.take() {
            match timeout_at(deadline, &mut timer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("LOGSERVICE | Flush timer failed: {e}"),
                Err(_) => {
                    // The timer reserves a queue slot before sealing, so it
                    // never holds documents here.
                    timer.abort();
                    error!("LOGSERVICE | Flush timer did not stop before the shutdown deadline");
                }
            }
        }

        let drained = match timeout_at(deadline, self.queue.reserve()).await {
            Ok(Ok(slot)) => {
                if let Some(batch) = self.buffer.close() {
                    slot.send(batch);
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if let Some(batch) = self.buffer.close() {
                    error!(
                        "LOGSERVICE | Delivery queue full at shutdown deadline, dropping {} documents",
                        batch.len()
                    );
                }
                Err(PipelineError::ShutdownTimeout)
            }
        };

        let closed = self
            .pool
            .close(deadline.saturating_duration_since(Instant::now()))
            .await;

        let stats = self.stats.snapshot();
        info!(
            "LOGSERVICE | Shutdown complete: added={} flushed={} failed={}",
            stats.added, stats.flushed, stats.failed
        );
        quiesced.and(drained).and(closed)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.timer_cancel.cancel();
    }
}

/// Seals the open batch once its first document is `flush_interval` old.
///
/// Sleeps until the open batch's deadline, or waits for the next document
/// (checking at least every `flush_interval`) while the buffer is empty.
async fn run_flush_timer(
    buffer: Arc<BatchBuffer>,
    queue: DeliveryQueue,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let deadline = buffer.deadline();
        let wake_at = deadline.unwrap_or_else(|| Instant::now() + flush_interval);
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(wake_at) => {}
            () = buffer.wait_for_documents(), if deadline.is_none() => continue,
        }

        if !buffer.deadline().is_some_and(|due| due <= Instant::now()) {
            continue;
        }
        // Reserve before sealing so cancellation never strands a sealed batch.
        let slot = tokio::select! {
            () = cancel.cancelled() => break,
            slot = queue.reserve() => slot,
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err(e) => {
                error!("LOGSERVICE | Flush timer cannot submit batches: {e}");
                break;
            }
        };
        if let Some(batch) = buffer.seal_due(Instant::now()) {
            slot.send(batch);
        }
    }
    debug!("LOGSERVICE | Flush timer stopped");
}
