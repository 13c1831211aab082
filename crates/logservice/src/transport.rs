// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bulk delivery of batches to the store.
//!
//! A batch is encoded as Elasticsearch `_bulk` NDJSON: a `create` action line
//! followed by the document, each terminated by a newline. The response
//! reports one result per document in request order.

use crate::batch::Batch;
use crate::config::Config;
use crate::constants::RETRY_ON_STATUS;
use crate::errors::PipelineError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Sends one batch and returns a result per document, in batch order.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    async fn bulk(&self, batch: &Batch) -> Result<Vec<ItemResult>, TransportError>;
}

/// Outcome the store reported for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Created,
    Failed(ItemError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorCause {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub reason: String,
}

/// Structured rejection of a single document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ItemError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub caused_by: Option<ErrorCause>,
}

impl ItemError {
    pub fn new(error_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            reason: reason.into(),
            caused_by: None,
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.caused_by {
            Some(cause) => write!(f, "{}: {}: {}", cause.error_type, cause.reason, self.reason),
            None => write!(f, "{}: {}", self.error_type, self.reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bulk request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bulk request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid bulk response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether the whole batch should be sent again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => RETRY_ON_STATUS.contains(status),
            TransportError::Request(e) => e.is_timeout() || e.is_connect(),
            TransportError::InvalidResponse(_) => false,
        }
    }
}

/// Action line preceding each document in the bulk body.
#[must_use]
pub fn action_line(index: &str) -> String {
    serde_json::json!({ "create": { "_index": index } }).to_string()
}

/// Encodes `batch` as a bulk request body.
#[must_use]
pub fn encode_bulk_body(action: &str, batch: &Batch) -> Vec<u8> {
    let mut body = Vec::with_capacity(batch.size_bytes());
    for doc in batch.documents() {
        body.extend_from_slice(action.as_bytes());
        body.push(b'\n');
        body.extend_from_slice(doc.as_bytes());
        body.push(b'\n');
    }
    body
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<ItemError>,
}

impl BulkResponseItem {
    fn into_result(self) -> ItemResult {
        match self.error {
            None if (200..300).contains(&self.status) => ItemResult::Created,
            Some(error) => ItemResult::Failed(error),
            None => ItemResult::Failed(ItemError::new(
                "status",
                format!("unexpected item status {}", self.status),
            )),
        }
    }
}

/// Parses a `_bulk` response body into per-document results.
pub fn parse_bulk_response(body: &[u8]) -> Result<Vec<ItemResult>, TransportError> {
    let response: BulkResponse = serde_json::from_slice(body)
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

    Ok(response
        .items
        .into_iter()
        .map(|item| match item.into_values().next() {
            Some(item) => item.into_result(),
            None => ItemResult::Failed(ItemError::new("empty_item", "bulk item has no action")),
        })
        .collect())
}

/// [`BulkTransport`] backed by the Elasticsearch `_bulk` API.
#[derive(Debug, Clone)]
pub struct ElasticsearchTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    action: String,
}

impl ElasticsearchTransport {
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PipelineError::Client(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
        let mut auth = HeaderValue::from_str(&format!("ApiKey {}", config.elasticsearch_api_key))
            .map_err(|e| PipelineError::Client(format!("invalid API key header: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        Ok(Self {
            client,
            url: format!("{}/_bulk", config.elasticsearch_url.trim_end_matches('/')),
            headers,
            action: action_line(&config.index_name),
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BulkTransport for ElasticsearchTransport {
    async fn bulk(&self, batch: &Batch) -> Result<Vec<ItemResult>, TransportError> {
        let body = encode_bulk_body(&self.action, batch);
        let resp = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        parse_bulk_response(&body)
    }
}
