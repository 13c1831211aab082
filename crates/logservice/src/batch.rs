// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio::time::Instant;

/// A transformed record, serialized as one JSON line without the trailing
/// newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document(Vec<u8>);

impl Document {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Document {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// What caused a batch to be sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    /// The batch reached the flush byte threshold.
    Size,
    /// The batch's first document reached the flush interval.
    Interval,
    /// An explicit flush was requested.
    Flush,
    /// The buffer was closed for shutdown.
    Close,
}

/// A sealed, ordered group of documents delivered in one bulk request.
///
/// Batches are only constructed by the buffer when sealing and expose no
/// mutating methods.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    documents: Vec<Document>,
    size_bytes: usize,
    opened_at: Instant,
    reason: SealReason,
}

impl Batch {
    pub(crate) fn new(
        id: u64,
        documents: Vec<Document>,
        size_bytes: usize,
        opened_at: Instant,
        reason: SealReason,
    ) -> Self {
        Self {
            id,
            documents,
            size_bytes,
            opened_at,
            reason,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Size of the batch in the bulk payload, action lines included.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// When the first document was appended.
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    #[must_use]
    pub fn reason(&self) -> SealReason {
        self.reason
    }
}
