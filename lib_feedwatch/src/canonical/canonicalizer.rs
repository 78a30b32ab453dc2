//! # Event Canonicalizer
//!
//! Converts one raw change-stream record into a `CanonicalEvent`. This is the
//! only place that knows about BSON types: object identifiers become their hex
//! string, native dates become ISO-8601 UTC strings, and everything else keeps
//! its JSON shape. Values that have no JSON counterpart (decimals, binaries,
//! regular expressions, ...) degrade to their display string.
//!
//! The conversion is total and idempotent. A record that already carries
//! canonical values canonicalizes to the same event.

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

use super::event::{to_iso_millis, CanonicalEvent, OperationKind};

/// A raw record as produced by the live-change feed.
pub type RawRecord = Document;

/// Canonicalizes one raw change record. Never fails.
pub fn canonicalize(raw: &RawRecord) -> CanonicalEvent {
    let operation_kind = match raw.get("operationType") {
        Some(Bson::String(name)) => OperationKind::from_wire(name),
        _ => OperationKind::Other,
    };

    let collection_name = match raw.get("ns") {
        Some(Bson::Document(ns)) => ns.get("coll").and_then(present).map(scalar_string),
        _ => None,
    };

    let document_key = match raw.get("documentKey") {
        Some(Bson::Document(key)) => key.get("_id").and_then(present).map(scalar_string),
        Some(other) => present(other).map(scalar_string),
        None => None,
    };

    CanonicalEvent {
        operation_kind,
        collection_name,
        document_key,
        occurred_at: occurred_at(raw),
        full_document: raw.get("fullDocument").and_then(present).map(canonical_value),
        update_description: raw.get("updateDescription").and_then(present).map(canonical_value),
    }
}

/// Recursively converts a BSON value into its canonical JSON form.
pub fn canonical_value(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(iso_date(dt)),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(key, item)| (key.clone(), canonical_value(item)))
                .collect::<Map<String, Value>>(),
        ),
        Bson::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        Bson::Null => Value::Null,
        Bson::Boolean(flag) => Value::Bool(*flag),
        Bson::String(text) => Value::String(text.clone()),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        // NaN and infinities have no JSON number form.
        Bson::Double(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(n.to_string())),
        other => Value::String(other.to_string()),
    }
}

/// String form of an identifier-like scalar, used for `documentKey` and names.
pub fn scalar_string(value: &Bson) -> String {
    match canonical_value(value) {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn present(value: &Bson) -> Option<&Bson> {
    match value {
        Bson::Null | Bson::Undefined => None,
        other => Some(other),
    }
}

fn iso_date(dt: &bson::DateTime) -> String {
    DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
        .map(|ts| to_iso_millis(&ts))
        .unwrap_or_else(|| dt.to_string())
}

/// Cluster time (seconds precision), then wall time, then now.
fn occurred_at(raw: &RawRecord) -> DateTime<Utc> {
    if let Some(Bson::Timestamp(ts)) = raw.get("clusterTime") {
        if let Some(at) = DateTime::<Utc>::from_timestamp(i64::from(ts.time), 0) {
            return at;
        }
    }
    if let Some(Bson::DateTime(dt)) = raw.get("wallTime") {
        if let Some(at) = DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis()) {
            return at;
        }
    }
    // Records that went through canonicalization already carry ISO strings.
    for field in ["clusterTime", "wallTime"] {
        if let Some(Bson::String(text)) = raw.get(field) {
            if let Ok(at) = DateTime::parse_from_rfc3339(text) {
                return at.with_timezone(&Utc);
            }
        }
    }
    Utc::now()
}
