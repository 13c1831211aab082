// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission of raw records by source tag.

use crate::constants::DEFAULT_VALID_SOURCES;
use serde::Deserialize;
use std::borrow::Cow;
use tracing::trace;

/// Only the `source` tag is read; every other field is skipped without
/// allocation.
#[derive(Deserialize)]
struct SourceProbe<'a> {
    #[serde(borrow, default)]
    source: Option<Cow<'a, str>>,
}

/// Decides whether a raw record is admitted into the pipeline.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    /// Sorted and deduplicated, so lookups can binary search.
    valid_sources: Vec<String>,
}

impl EntryFilter {
    /// Builds a filter from an allow-list. An empty list admits the default
    /// sources.
    pub fn new<I, S>(valid_sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut valid_sources: Vec<String> = valid_sources.into_iter().map(Into::into).collect();
        if valid_sources.is_empty() {
            valid_sources = DEFAULT_VALID_SOURCES
                .iter()
                .map(ToString::to_string)
                .collect();
        }
        valid_sources.sort_unstable();
        valid_sources.dedup();

        Self { valid_sources }
    }

    /// Returns true when the record carries an allow-listed `source` tag.
    ///
    /// Malformed JSON, a missing tag and a non-string tag all reject.
    #[must_use]
    pub fn admit(&self, record: &[u8]) -> bool {
        // Structs also deserialize from arrays; only objects carry a tag.
        if record.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
            trace!("LOGSERVICE | Dropping record that is not a JSON object");
            return false;
        }

        match serde_json::from_slice::<SourceProbe<'_>>(record) {
            Ok(SourceProbe {
                source: Some(source),
            }) => self.is_allowed(&source),
            Ok(SourceProbe { source: None }) => {
                trace!("LOGSERVICE | Dropping record without a source tag");
                false
            }
            Err(e) => {
                trace!("LOGSERVICE | Dropping unparsable record: {e}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_allowed(&self, source: &str) -> bool {
        self.valid_sources
            .binary_search_by(|candidate| candidate.as_str().cmp(source))
            .is_ok()
    }

    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.valid_sources
    }
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}
