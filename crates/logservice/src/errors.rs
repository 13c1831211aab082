// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the pipeline.
//!
//! Rejected records are not errors: the filter drops them and `ingest` reports
//! zero bytes written. Delivery failures are not surfaced here either; they are
//! counted in [`crate::stats::Stats`] and logged by the delivery workers.

/// Missing or invalid configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing Elasticsearch URL")]
    MissingUrl,

    #[error("missing Elasticsearch API key")]
    MissingApiKey,

    #[error("missing index name")]
    MissingIndex,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A record that passed the filter could not be turned into a document.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("cannot write {path}: {segment} is not an object")]
    PathConflict { path: String, segment: String },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors returned by the pipeline's public operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Delivery queue is closed")]
    QueueClosed,

    #[error("Flush timeout exceeded")]
    FlushTimeout,

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}
