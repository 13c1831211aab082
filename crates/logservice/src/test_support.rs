// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batch::Batch;
use crate::transport::{BulkTransport, ItemResult, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Response = Result<Vec<ItemResult>, TransportError>;

/// Transport that replays canned responses, then reports every document as
/// created.
pub(crate) struct ScriptedTransport {
    responses: Mutex<VecDeque<Response>>,
    calls: AtomicUsize,
    hang: bool,
    documents: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(responses: Vec<Response>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            hang: false,
            documents: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Never answers.
    pub(crate) fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::succeeding()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Bodies of every document sent, retries included.
    pub(crate) fn documents(&self) -> Vec<Vec<u8>> {
        self.documents.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl BulkTransport for ScriptedTransport {
    async fn bulk(&self, batch: &Batch) -> Result<Vec<ItemResult>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.documents
            .lock()
            .expect("lock poisoned")
            .extend(batch.documents().iter().map(|d| d.as_bytes().to_vec()));

        let scripted = self.responses.lock().expect("lock poisoned").pop_front();
        scripted.unwrap_or_else(|| Ok(vec![ItemResult::Created; batch.len()]))
    }
}
