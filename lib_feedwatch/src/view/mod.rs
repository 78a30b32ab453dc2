//! # View Module
//!
//! Consumer-side presentation of a channel's events. Nothing here talks to the
//! registry; it works over whatever a `SubscriptionHandle` delivered.
//!
//! ## Core Components:
//!
//! - **`filter`**: `FilterSpec` and `apply`, the non-destructive filtered view.
//! - **`event_log`**: The retained per-channel history with clear and view.
//! - **`format`**: Local-time rendering with an hour offset.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Retained per-channel history.
pub mod event_log;
/// Filter specification and application.
pub mod filter;
/// Timestamp rendering.
pub mod format;

pub use event_log::EventLog;
pub use filter::{apply, FilterSpec};
pub use format::format_local;
