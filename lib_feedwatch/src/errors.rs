//! # Error Taxonomy
//!
//! Two families of failure exist for a channel. Synchronous ones are returned
//! straight from `Registry::subscribe` and mean no subscription was created.
//! Asynchronous ones happen after the watcher has been scheduled and are
//! delivered exactly once on the channel's error stream.

use thiserror::Error;

/// Fallback text for transport failures whose driver message is empty.
pub const TRANSPORT_FALLBACK: &str = "change stream error";
/// Fallback text for connect failures whose driver message is empty.
pub const CONNECT_FALLBACK: &str = "unable to open change stream";

/// Errors rejected synchronously by `Registry::subscribe`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The caller did not supply a channel identifier.
    #[error("channel id must not be empty")]
    EmptyChannelId,

    /// The target descriptor is unusable (blank URI or database).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The channel already has a starting, active or closing subscription.
    #[error("channel '{0}' is already subscribed")]
    AlreadySubscribed(String),
}

/// Terminal failures of a running feed. The `Display` form is what consumers
/// see on the error stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The connection or the live-change cursor could not be opened.
    #[error("{0}")]
    ConnectFailed(String),

    /// The feed dropped after it was established.
    #[error("{0}")]
    Transport(String),
}

impl FeedError {
    /// Builds a `ConnectFailed`, substituting the fallback text for blank messages.
    pub fn connect(reason: impl Into<String>) -> Self {
        Self::ConnectFailed(non_blank(reason.into(), CONNECT_FALLBACK))
    }

    /// Builds a `Transport`, substituting the fallback text for blank messages.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport(non_blank(reason.into(), TRANSPORT_FALLBACK))
    }

    /// The human readable reason, without the variant.
    pub fn reason(&self) -> &str {
        match self {
            Self::ConnectFailed(r) | Self::Transport(r) => r,
        }
    }
}

/// Returned by a sink whose consumer has gone away.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("delivery sink closed")]
pub struct SinkClosed;

fn non_blank(reason: String, fallback: &str) -> String {
    if reason.trim().is_empty() {
        fallback.to_string()
    } else {
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_driver_messages_use_fallbacks() {
        assert_eq!(FeedError::transport("").to_string(), TRANSPORT_FALLBACK);
        assert_eq!(FeedError::connect("  ").to_string(), CONNECT_FALLBACK);
    }

    #[test]
    fn display_is_the_bare_reason() {
        let err = FeedError::transport("connection reset by peer");
        assert_eq!(err.to_string(), "connection reset by peer");
        assert_eq!(err.reason(), "connection reset by peer");
    }

    #[test]
    fn subscribe_errors_name_the_channel() {
        let err = SubscribeError::AlreadySubscribed("ch1".into());
        assert_eq!(err.to_string(), "channel 'ch1' is already subscribed");
    }
}
