//! # Canonical Event
//!
//! The transport-agnostic shape of one data-mutation notification. Every field
//! holds only primitive or structured JSON values, so the event serializes the
//! same way no matter which database produced it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A document was inserted.
    Insert,
    /// A document was partially updated.
    Update,
    /// A document was deleted.
    Delete,
    /// A document was replaced wholesale.
    Replace,
    /// A collection was dropped.
    Drop,
    /// A collection was renamed.
    Rename,
    /// The feed was invalidated by the server.
    Invalidate,
    /// Anything else the feed reports (index builds, database drops, ...).
    Other,
}

impl OperationKind {
    /// Every kind, in presentation order.
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::Replace,
        OperationKind::Drop,
        OperationKind::Rename,
        OperationKind::Invalidate,
        OperationKind::Other,
    ];

    /// Maps the feed's `operationType` string. Unknown names become `Other`.
    pub fn from_wire(name: &str) -> Self {
        name.parse().unwrap_or(OperationKind::Other)
    }

    /// The lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Replace => "replace",
            OperationKind::Drop => "drop",
            OperationKind::Rename => "rename",
            OperationKind::Invalidate => "invalidate",
            OperationKind::Other => "other",
        }
    }

    /// Kinds whose document payload is worth expanding in a view.
    pub fn has_detail(&self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::Update | OperationKind::Replace
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind '{}'", s))
    }
}

/// # Canonical Event
///
/// One normalized change notification. `documentKey` is always the string form
/// of the source identifier so consumers can match it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    /// What happened.
    pub operation_kind: OperationKind,
    /// Collection the change applies to; absent for database-wide operations.
    pub collection_name: Option<String>,
    /// String form of the changed document's identifier.
    pub document_key: Option<String>,
    /// When the change happened, as a UTC instant.
    #[serde(with = "iso_millis")]
    pub occurred_at: DateTime<Utc>,
    /// Post-image of the document, if the feed supplied one.
    pub full_document: Option<Value>,
    /// Changed and removed fields for `update` events.
    pub update_description: Option<Value>,
}

/// ISO-8601 UTC with millisecond precision and a `Z` suffix.
pub fn to_iso_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_iso_millis(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn wire_names_round_trip_and_unknowns_fold_to_other() {
        for kind in OperationKind::ALL {
            assert_eq!(OperationKind::from_wire(kind.as_str()), kind);
        }
        assert_eq!(OperationKind::from_wire("dropDatabase"), OperationKind::Other);
        assert_eq!(OperationKind::from_wire("createIndexes"), OperationKind::Other);
        assert!("INSERT".parse::<OperationKind>().is_err());
    }

    #[test]
    fn detail_kinds() {
        let detailed: Vec<_> = OperationKind::ALL.into_iter().filter(|k| k.has_detail()).collect();
        assert_eq!(
            detailed,
            vec![OperationKind::Insert, OperationKind::Update, OperationKind::Replace]
        );
    }

    #[test]
    fn serializes_with_camel_case_and_iso_timestamp() {
        let event = CanonicalEvent {
            operation_kind: OperationKind::Insert,
            collection_name: Some("orders".into()),
            document_key: Some("65f1c0ffee".into()),
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            full_document: Some(json!({"total": 12})),
            update_description: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "operationKind": "insert",
                "collectionName": "orders",
                "documentKey": "65f1c0ffee",
                "occurredAt": "2024-05-01T10:00:00.000Z",
                "fullDocument": {"total": 12},
                "updateDescription": null,
            })
        );

        let back: CanonicalEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
