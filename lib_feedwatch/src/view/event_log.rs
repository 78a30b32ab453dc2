//! # Retained Event Log
//!
//! Holds everything a channel has delivered so far, plus its terminal error.
//! Views are recomputed from the full log on demand, so changing a filter
//! never loses data.

use std::collections::HashSet;

use crate::canonical::CanonicalEvent;
use crate::core::sink::Delivery;
use crate::view::filter::{apply, FilterSpec};

/// The retained, insertion-ordered history of one channel.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<CanonicalEvent>,
    last_error: Option<String>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one delivery from the channel.
    pub fn ingest(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Event(event) => self.events.push(event),
            Delivery::Failed(error) => self.last_error = Some(error.to_string()),
        }
    }

    /// Appends one event.
    pub fn push(&mut self, event: CanonicalEvent) {
        self.events.push(event);
    }

    /// Drops all retained events and the last error.
    pub fn clear(&mut self) {
        self.events.clear();
        self.last_error = None;
    }

    /// Events in arrival order.
    pub fn events(&self) -> &[CanonicalEvent] {
        &self.events
    }

    /// The terminal error string, if the channel failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The filtered view, most recent first.
    pub fn view(&self, spec: &FilterSpec) -> Vec<&CanonicalEvent> {
        apply(&self.events, spec)
    }

    /// Collection names seen so far, in order of first appearance.
    pub fn collections(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.events
            .iter()
            .filter_map(|event| event.collection_name.as_ref())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Collection choices for a picker: selected names first, then the rest,
    /// each group keeping first-appearance order.
    pub fn collection_options(&self, selected: &HashSet<String>) -> Vec<String> {
        let (mut chosen, rest): (Vec<String>, Vec<String>) =
            self.collections().into_iter().partition(|name| selected.contains(name));
        chosen.extend(rest);
        chosen
    }
}
