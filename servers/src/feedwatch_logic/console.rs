//! Rendering of delivered events for stdout.

use lib_feedwatch::view::format_local;
use lib_feedwatch::{CanonicalEvent, FeedError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned columns, one event per line, with a detail line for document-bearing kinds.
    Table,
    /// One JSON object per line.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}' (expected table or json)", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Table => f.write_str("table"),
            OutputFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventLine<'a> {
    channel: &'a str,
    local_time: String,
    #[serde(flatten)]
    event: &'a CanonicalEvent,
}

#[derive(Serialize)]
struct ErrorLine<'a> {
    channel: &'a str,
    error: String,
}

pub fn table_header() -> String {
    format!("{:<19}  {:<14}  {:<10}  {:<20}  {}", "TIME", "CHANNEL", "OPERATION", "COLLECTION", "DOCUMENT KEY")
}

pub fn render_event(format: OutputFormat, channel: &str, event: &CanonicalEvent, offset_hours: f64) -> String {
    let local_time = format_local(&event.occurred_at, offset_hours);
    match format {
        OutputFormat::Json => {
            let line = EventLine { channel, local_time, event };
            serde_json::to_string(&line).unwrap_or_default()
        }
        OutputFormat::Table => {
            let mut row = format!(
                "{:<19}  {:<14}  {:<10}  {:<20}  {}",
                local_time,
                channel,
                event.operation_kind,
                event.collection_name.as_deref().unwrap_or("-"),
                event.document_key.as_deref().unwrap_or("-"),
            );
            if let Some(detail) = detail_of(event) {
                row.push_str("\n    ");
                row.push_str(&detail);
            }
            row
        }
    }
}

pub fn render_failure(format: OutputFormat, channel: &str, error: &FeedError) -> String {
    match format {
        OutputFormat::Json => {
            let line = ErrorLine { channel, error: error.to_string() };
            serde_json::to_string(&line).unwrap_or_default()
        }
        OutputFormat::Table => format!("{:<19}  {:<14}  {:<10}  {}", "", channel, "ERROR", error),
    }
}

// Updates show what changed; inserts and replaces show the new document.
fn detail_of(event: &CanonicalEvent) -> Option<String> {
    if !event.operation_kind.has_detail() {
        return None;
    }
    event
        .update_description
        .as_ref()
        .or(event.full_document.as_ref())
        .map(|value| value.to_string())
}
