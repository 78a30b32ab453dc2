//! # Core Engine Module
//!
//! The change-feed subscription multiplexer. It opens one live change feed per
//! logical channel, keeps channels isolated from each other, and hands each
//! channel's canonical events and terminal error to that channel's consumer.
//!
//! ## Core Components:
//!
//! - **`registry`**: The process-wide table of channels. Enforces one feed per
//!   channel id, starts watchers, and tears them down on unsubscribe with a
//!   bounded grace period.
//!
//! - **`watcher`**: The per-subscription worker and its state machine. Owns the
//!   connection and the live-change cursor, canonicalizes records and pushes
//!   them to the sink in arrival order.
//!
//! - **`sink`**: The per-channel output boundary, an event queue plus a single
//!   terminal error, with pull-style and push-style implementations.
//!
//! - **`feed`**: The connector and feed traits the watcher drives, so the
//!   engine never depends on a particular database driver.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Connector and feed abstractions plus the target descriptor.
pub mod feed;
/// The channel table: subscribe, unsubscribe, introspection.
pub mod registry;
/// Event and error delivery to consumers.
pub mod sink;
/// The per-subscription worker.
pub mod watcher;

// --- Public API Re-exports ---
pub use feed::{mask_url_password, ChangeFeed, FeedConnector, TargetDescriptor};
pub use registry::{Registry, TEARDOWN_GRACE};
pub use sink::{bounded_channel_sink, channel_sink, CallbackSink, ChannelSink, Delivery, DeliverySink, SubscriptionHandle};
pub use watcher::SubscriptionState;
