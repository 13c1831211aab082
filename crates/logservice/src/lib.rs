// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logservice
//!
//! Batched ingestion of newline-delimited log-drain records into an
//! Elasticsearch data stream.
//!
//! Records pass through an allow-list [`EntryFilter`], are reshaped by the
//! [`EntryTransformer`], accumulate in a size- and age-bounded
//! [`BatchBuffer`] and are shipped by a pool of delivery workers through a
//! [`BulkTransport`]. [`Pipeline`] wires these together and owns graceful
//! shutdown.
//!
//! ```rust,ignore
//! let config = logservice::Config::from_env()?;
//! let pipeline = logservice::Pipeline::new(&config)?;
//! pipeline.ingest(br#"{"source":"build","message":"ok"}"#).await?;
//! pipeline.shutdown(Duration::from_secs(10)).await?;
//! ```

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod batch;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod errors;
pub mod filter;
pub mod pipeline;
pub mod stats;
pub mod transform;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use batch::{Batch, Document, SealReason};
pub use buffer::BatchBuffer;
pub use config::{Config, RetryStrategy};
pub use delivery::{BatchReport, DeliveryOutcome};
pub use errors::{ConfigError, PipelineError, TransformError};
pub use filter::EntryFilter;
pub use pipeline::Pipeline;
pub use stats::StatsSnapshot;
pub use transform::EntryTransformer;
pub use transport::{BulkTransport, ElasticsearchTransport, ItemError, ItemResult, TransportError};
