//! # Event Filter
//!
//! Consumer-side filtering over the delivered event sequence.
//!
//! - An empty set in a dimension means no restriction on that dimension
//! - Values inside one dimension are OR'd
//! - Dimensions are AND'd
//!
//! `apply` never mutates its input. The result is presented most recent first.

use std::collections::HashSet;

use crate::canonical::{CanonicalEvent, OperationKind};

/// What a consumer wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    /// Operation kinds to keep (empty = all).
    pub operation_kinds: HashSet<OperationKind>,
    /// Collection names to keep (empty = all).
    pub collection_names: HashSet<String>,
    /// Exact document key to keep. Blank means no restriction.
    pub exact_document_key: Option<String>,
}

impl FilterSpec {
    /// A filter that keeps everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given operation kinds.
    pub fn with_operations(mut self, kinds: impl IntoIterator<Item = OperationKind>) -> Self {
        self.operation_kinds.extend(kinds);
        self
    }

    /// Restricts to the given collections.
    pub fn with_collections<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.collection_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restricts to one document key.
    pub fn with_document_key(mut self, key: impl Into<String>) -> Self {
        self.exact_document_key = Some(key.into());
        self
    }

    /// True when the filter keeps every event.
    pub fn is_unrestricted(&self) -> bool {
        self.operation_kinds.is_empty() && self.collection_names.is_empty() && self.document_key().is_none()
    }

    /// The document key restriction, ignoring blank input.
    pub fn document_key(&self) -> Option<&str> {
        self.exact_document_key.as_deref().filter(|key| !key.is_empty())
    }

    /// Whether one event passes the filter.
    pub fn matches(&self, event: &CanonicalEvent) -> bool {
        if !self.operation_kinds.is_empty() && !self.operation_kinds.contains(&event.operation_kind) {
            return false;
        }
        if !self.collection_names.is_empty() {
            match &event.collection_name {
                Some(name) if self.collection_names.contains(name) => {}
                _ => return false,
            }
        }
        if let Some(key) = self.document_key() {
            if event.document_key.as_deref() != Some(key) {
                return false;
            }
        }
        true
    }
}

/// Filters `events` (oldest first) and returns the matches most recent first.
pub fn apply<'a>(events: &'a [CanonicalEvent], spec: &FilterSpec) -> Vec<&'a CanonicalEvent> {
    events.iter().rev().filter(|event| spec.matches(event)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(kind: OperationKind, coll: Option<&str>, key: Option<&str>, minute: u32) -> CanonicalEvent {
        CanonicalEvent {
            operation_kind: kind,
            collection_name: coll.map(String::from),
            document_key: key.map(String::from),
            occurred_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            full_document: None,
            update_description: None,
        }
    }

    fn sample() -> Vec<CanonicalEvent> {
        vec![
            event(OperationKind::Insert, Some("orders"), Some("1"), 0),
            event(OperationKind::Update, Some("orders"), Some("1"), 1),
            event(OperationKind::Insert, Some("users"), Some("2"), 2),
            event(OperationKind::Delete, Some("orders"), Some("3"), 3),
            event(OperationKind::Other, None, None, 4),
        ]
    }

    fn minutes(view: &[&CanonicalEvent]) -> Vec<u32> {
        use chrono::Timelike;
        view.iter().map(|e| e.occurred_at.minute()).collect()
    }

    #[test]
    fn empty_filter_returns_everything_newest_first() {
        let events = sample();
        let view = apply(&events, &FilterSpec::new());
        assert_eq!(minutes(&view), vec![4, 3, 2, 1, 0]);
        assert!(FilterSpec::new().is_unrestricted());
    }

    #[test]
    fn dimensions_are_anded_values_are_ored() {
        let events = sample();
        let spec = FilterSpec::new()
            .with_operations([OperationKind::Insert, OperationKind::Delete])
            .with_collections(["orders"]);
        assert_eq!(minutes(&apply(&events, &spec)), vec![3, 0]);
    }

    #[test]
    fn collection_filter_excludes_database_wide_events() {
        let events = sample();
        let spec = FilterSpec::new().with_collections(["orders", "users"]);
        assert_eq!(minutes(&apply(&events, &spec)), vec![3, 2, 1, 0]);
    }

    #[test]
    fn document_key_is_an_exact_match() {
        let events = sample();
        assert_eq!(minutes(&apply(&events, &FilterSpec::new().with_document_key("1"))), vec![1, 0]);
        assert!(apply(&events, &FilterSpec::new().with_document_key("10")).is_empty());
    }

    #[test]
    fn blank_document_key_is_no_restriction() {
        let events = sample();
        let spec = FilterSpec::new().with_document_key("");
        assert!(spec.is_unrestricted());
        assert_eq!(apply(&events, &spec).len(), events.len());
    }

    #[test]
    fn apply_leaves_input_untouched() {
        let events = sample();
        let before = events.clone();
        let _ = apply(&events, &FilterSpec::new().with_operations([OperationKind::Update]));
        assert_eq!(events, before);
    }
}
