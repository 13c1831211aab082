// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifetime throughput counters.

use crate::delivery::{BatchReport, DeliveryOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    added: AtomicU64,
    flushed: AtomicU64,
    created: AtomicU64,
    failed: AtomicU64,
    requests: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Documents accepted into the batch buffer
    pub added: u64,
    /// Documents the store accepted
    pub flushed: u64,
    /// Documents the store created
    pub created: u64,
    /// Documents that failed delivery
    pub failed: u64,
    /// Bulk requests sent, retries included
    pub requests: u64,
    /// Batch resends after a transient failure. Counts requests, not
    /// documents.
    pub retried: u64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds a worker's per-document outcomes into the counters.
    pub fn record_report(&self, report: &BatchReport) {
        let mut created = 0;
        let mut failed = 0;
        for outcome in &report.outcomes {
            match outcome {
                DeliveryOutcome::Created => created += 1,
                DeliveryOutcome::Failed(_) => failed += 1,
            }
        }

        self.requests.fetch_add(report.attempts, Ordering::Relaxed);
        self.retried.fetch_add(report.retries(), Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.created.fetch_add(created, Ordering::Relaxed);
        self.flushed.fetch_add(created, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            added: self.added.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}
