// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults for the ingestion pipeline and the bulk API.

use std::time::Duration;

/// Index (data stream) written to when none is configured.
pub const DEFAULT_INDEX_NAME: &str = "logservice-logs";

/// A batch is sealed once its wire size reaches this many bytes.
pub const DEFAULT_FLUSH_BYTES: usize = 1_000_000;

/// A batch is sealed once its first document is this old.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Source tags admitted when the allow-list is left empty.
pub const DEFAULT_VALID_SOURCES: [&str; 2] = ["build", "lambda"];

pub const DEFAULT_NUM_WORKERS: usize = 2;

/// Sealed batches waiting for a worker before `ingest` starts to wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Retries after the first attempt for transient transport failures.
pub const DEFAULT_MAX_RETRIES: u64 = 10;

pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP statuses from the bulk endpoint that are retried.
pub const RETRY_ON_STATUS: [u16; 4] = [429, 502, 503, 504];

/// Classification fields stamped on every document.
pub const EVENT_DATASET: &str = "vercel";
pub const DATA_STREAM_TYPE: &str = "logs";
