//! # lib_feedwatch
//!
//! A change-feed subscription multiplexer. Consumers subscribe a logical
//! channel to a database target, receive that channel's changes as canonical
//! events in arrival order, and unsubscribe when done. Each channel owns one
//! live feed and fails independently of the others.

// Declare the modules to re-export
pub mod canonical;
pub mod core;
pub mod errors;
pub mod view;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export everything consumers usually need
pub use canonical::{canonicalize, CanonicalEvent, OperationKind, RawRecord};
pub use crate::core::{
    CallbackSink, ChangeFeed, Delivery, DeliverySink, FeedConnector, Registry, SubscriptionHandle,
    SubscriptionState, TargetDescriptor,
};
pub use errors::{FeedError, SinkClosed, SubscribeError};
pub use view::{format_local, EventLog, FilterSpec};

#[cfg(feature = "connections")]
pub use connections::MongoConnector;
