// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reshaping of admitted records into the indexed document schema.
//!
//! Every document carries `@timestamp`, `source`, `event.dataset` and
//! `data_stream.type`. Further fields depend on the record's source tag and
//! are listed in [`SOURCE_SPECS`]; adding a source is a table entry.
//!
//! Dotted output names are nested objects, so `event.dataset` is written as
//! `{"event":{"dataset":"vercel"}}`.

use crate::batch::Document;
use crate::constants::{DATA_STREAM_TYPE, EVENT_DATASET};
use crate::errors::TransformError;
use reqwest::StatusCode;
use serde_json::{Map, Value};

/// Adds derived fields to a document built from `record`.
pub type Enricher =
    fn(record: &Map<String, Value>, doc: &mut Map<String, Value>) -> Result<(), TransformError>;

/// Field mapping for one source tag.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub tag: &'static str,
    /// Copied as strings, in this order. Absent fields become `""`.
    pub fields: &'static [&'static str],
    pub enrich: Option<Enricher>,
}

pub const SOURCE_SPECS: &[SourceSpec] = &[
    SourceSpec {
        tag: "build",
        fields: &["buildId", "deploymentId", "entrypoint", "message", "projectId"],
        enrich: None,
    },
    SourceSpec {
        tag: "lambda",
        fields: &["deploymentId", "path", "projectId"],
        enrich: Some(enrich_lambda as Enricher),
    },
];

#[must_use]
pub fn source_spec(tag: &str) -> Option<&'static SourceSpec> {
    SOURCE_SPECS.iter().find(|spec| spec.tag == tag)
}

/// Stateless transformer from source records to documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryTransformer;

impl EntryTransformer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Builds the document for `record`.
    ///
    /// Fails only when the record is not a JSON object or the document cannot
    /// be written; missing input fields never fail.
    pub fn transform(&self, record: &[u8]) -> Result<Document, TransformError> {
        let record = match serde_json::from_slice::<Value>(record) {
            Ok(Value::Object(record)) => record,
            Ok(other) => {
                return Err(TransformError::Malformed(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(TransformError::Malformed(e.to_string())),
        };

        let mut doc = Map::new();

        let timestamp = match record.get("timestamp") {
            Some(Value::Number(n)) => Value::Number(n.clone()),
            _ => Value::from(0),
        };
        doc.insert("@timestamp".to_string(), timestamp);

        let source = field_as_string(&record, "source");
        set_path(&mut doc, "source", Value::String(source.clone()))?;
        set_path(&mut doc, "event.dataset", Value::from(EVENT_DATASET))?;
        set_path(&mut doc, "data_stream.type", Value::from(DATA_STREAM_TYPE))?;

        if let Some(spec) = source_spec(&source) {
            for field in spec.fields {
                let value = field_as_string(&record, field);
                set_path(&mut doc, field, Value::String(value))?;
            }
            if let Some(enrich) = spec.enrich {
                enrich(&record, &mut doc)?;
            }
        }

        Ok(Document::new(serde_json::to_vec(&Value::Object(doc))?))
    }
}

/// Formats the proxy summary into `message` and adds the HTTP fields.
fn enrich_lambda(
    record: &Map<String, Value>,
    doc: &mut Map<String, Value>,
) -> Result<(), TransformError> {
    let status = field_as_string(record, "proxy.statusCode");
    let method = field_as_string(record, "proxy.method");
    let path = field_as_string(record, "proxy.path");
    let message = field_as_string(record, "message");

    let reason = status_reason(lookup(record, "proxy.statusCode"));
    let summary = format!("[{status} {reason}] {method} {path} {message}");

    set_path(doc, "message", Value::String(summary))?;
    set_path(doc, "http.request.method", Value::String(method))?;
    set_path(doc, "url.path", Value::String(path))?;
    set_path(doc, "http.response.status_code", Value::String(status))?;
    Ok(())
}

/// Reason phrase for an HTTP status, empty when the code is unknown.
fn status_reason(code: Option<&Value>) -> &'static str {
    let code = match code {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    let Some(code) = code.and_then(|code| u16::try_from(code).ok()) else {
        return "";
    };
    // RFC 2616 wording, and codes missing from `canonical_reason`.
    match code {
        103 => "Early Hints",
        413 => "Request Entity Too Large",
        414 => "Request URI Too Long",
        416 => "Requested Range Not Satisfiable",
        425 => "Too Early",
        _ => StatusCode::from_u16(code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or(""),
    }
}

/// Walks a dotted path through nested objects.
fn lookup<'a>(record: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Reads `path` as a string: strings verbatim, null or absent as `""`, and
/// anything else as compact JSON text.
fn field_as_string(record: &Map<String, Value>, path: &str) -> String {
    match lookup(record, path) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Writes `value` at a dotted path, creating intermediate objects.
fn set_path(
    doc: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<(), TransformError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return Ok(());
    };

    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(TransformError::PathConflict {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })
            }
        };
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transform(record: Value) -> Value {
        let doc = EntryTransformer::new()
            .transform(record.to_string().as_bytes())
            .expect("transform failed");
        serde_json::from_slice(doc.as_bytes()).expect("document is not JSON")
    }

    #[test]
    fn test_build_record() {
        let doc = transform(json!({
            "source": "build",
            "timestamp": 1_668_000_000_000_u64,
            "buildId": "b1",
            "deploymentId": "dpl_1",
            "entrypoint": "api/index.js",
            "message": "Compiled",
            "projectId": "prj_1",
            "host": "ignored.vercel.app"
        }));

        assert_eq!(
            doc,
            json!({
                "@timestamp": 1_668_000_000_000_u64,
                "source": "build",
                "event": {"dataset": "vercel"},
                "data_stream": {"type": "logs"},
                "buildId": "b1",
                "deploymentId": "dpl_1",
                "entrypoint": "api/index.js",
                "message": "Compiled",
                "projectId": "prj_1"
            })
        );
    }

    #[test]
    fn test_lambda_record() {
        let doc = transform(json!({
            "source": "lambda",
            "timestamp": 1,
            "deploymentId": "dpl_2",
            "path": "api/x",
            "projectId": "prj_2",
            "message": "m",
            "proxy": {"statusCode": 404, "method": "GET", "path": "/x"}
        }));

        assert_eq!(doc["message"], "[404 Not Found] GET /x m");
        assert_eq!(doc["http"]["request"]["method"], "GET");
        assert_eq!(doc["http"]["response"]["status_code"], "404");
        assert_eq!(doc["url"]["path"], "/x");
        assert_eq!(doc["path"], "api/x");
        assert_eq!(doc["deploymentId"], "dpl_2");
    }

    #[test]
    fn test_lambda_unknown_status() {
        let doc = transform(json!({
            "source": "lambda",
            "message": "m",
            "proxy": {"statusCode": 799, "method": "POST", "path": "/y"}
        }));
        assert_eq!(doc["message"], "[799 ] POST /y m");
    }

    #[test]
    fn test_lambda_without_proxy() {
        let doc = transform(json!({"source": "lambda"}));
        assert_eq!(doc["message"], "[ ]   ");
        assert_eq!(doc["http"]["response"]["status_code"], "");
        assert_eq!(doc["projectId"], "");
    }

    #[test]
    fn test_minimal_record_has_required_fields() {
        let doc = transform(json!({"source": "build"}));
        assert_eq!(doc["@timestamp"], 0);
        assert_eq!(doc["source"], "build");
        assert_eq!(doc["event"]["dataset"], "vercel");
        assert_eq!(doc["data_stream"]["type"], "logs");
        assert_eq!(doc["buildId"], "");
        assert_eq!(doc["message"], "");
    }

    #[test]
    fn test_non_numeric_timestamp_is_zero() {
        let doc = transform(json!({"source": "build", "timestamp": "yesterday"}));
        assert_eq!(doc["@timestamp"], 0);
    }

    #[test]
    fn test_unmapped_source_copies_no_extra_fields() {
        let doc = transform(json!({"source": "edge", "message": "hi", "timestamp": 5}));
        let keys: Vec<&String> = doc.as_object().expect("object").keys().collect();
        assert_eq!(keys, ["@timestamp", "source", "event", "data_stream"]);
    }

    #[test]
    fn test_scalar_fields_are_stringified() {
        let doc = transform(json!({
            "source": "build",
            "buildId": 12,
            "deploymentId": true,
            "entrypoint": null,
            "message": {"text": "nested"}
        }));
        assert_eq!(doc["buildId"], "12");
        assert_eq!(doc["deploymentId"], "true");
        assert_eq!(doc["entrypoint"], "");
        assert_eq!(doc["message"], r#"{"text":"nested"}"#);
    }

    #[test]
    fn test_transform_is_deterministic() {
        let record = br#"{"source":"lambda","proxy":{"statusCode":200,"method":"GET","path":"/"}}"#;
        let transformer = EntryTransformer::new();
        let first = transformer.transform(record).expect("transform failed");
        let second = transformer.transform(record).expect("transform failed");
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_records() {
        let transformer = EntryTransformer::new();
        assert!(matches!(
            transformer.transform(b"{not json"),
            Err(TransformError::Malformed(_))
        ));
        assert!(matches!(
            transformer.transform(b"[1,2]"),
            Err(TransformError::Malformed(_))
        ));
    }

    #[test]
    fn test_set_path_conflict() {
        let mut doc = Map::new();
        doc.insert("http".to_string(), Value::from("flat"));
        let result = set_path(&mut doc, "http.request.method", Value::from("GET"));
        assert!(matches!(
            result,
            Err(TransformError::PathConflict { segment, .. }) if segment == "http"
        ));
    }

    #[test]
    fn test_status_reason() {
        assert_eq!(status_reason(Some(&json!(503))), "Service Unavailable");
        assert_eq!(status_reason(Some(&json!("418"))), "I'm a teapot");
        assert_eq!(status_reason(Some(&json!(-1))), "");
        assert_eq!(status_reason(None), "");
    }

    #[test]
    fn test_status_reason_uses_rfc2616_wording() {
        assert_eq!(status_reason(Some(&json!(413))), "Request Entity Too Large");
        assert_eq!(status_reason(Some(&json!(414))), "Request URI Too Long");
        assert_eq!(
            status_reason(Some(&json!(416))),
            "Requested Range Not Satisfiable"
        );
        assert_eq!(status_reason(Some(&json!(404))), "Not Found");
    }
}
