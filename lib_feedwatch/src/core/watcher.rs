//! # Feed Watcher
//!
//! One watcher runs per active subscription. It opens the change feed, pulls
//! raw records, canonicalizes them and pushes them into the channel's sink. It
//! is the only writer to that sink and the only owner of the feed.
//!
//! ```text
//! Starting ──open ok──▶ Active ──cancel / sink gone──▶ Closing ──▶ Closed
//!    │                    │
//!    ├──cancel──▶ Closed  └──transport error / end of stream──▶ Failed
//!    └──open error──────────────────────────────────────────▶ Failed
//! ```
//!
//! There is no automatic reconnect. A failed channel stays failed until the
//! caller subscribes again.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::canonical::{canonicalize, RawRecord};
use crate::core::feed::{ChangeFeed, FeedConnector, TargetDescriptor};
use crate::core::sink::DeliverySink;
use crate::errors::{FeedError, SinkClosed};

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Opening the connection and the live-change cursor.
    Starting,
    /// Receiving and forwarding records.
    Active,
    /// Stopping voluntarily and releasing resources.
    Closing,
    /// Stopped voluntarily; resources released.
    Closed,
    /// Stopped after a connect or transport error; resources released.
    Failed,
}

impl SubscriptionState {
    /// `Closed` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Closed | SubscriptionState::Failed)
    }
}

/// Removes the watcher's own registry entry when it stops on its own.
pub(crate) type Deregister = Box<dyn FnOnce() + Send>;

/// Everything one watcher owns for its lifetime.
pub(crate) struct FeedWatcher {
    pub(crate) channel_id: String,
    pub(crate) target: TargetDescriptor,
    pub(crate) connector: Arc<dyn FeedConnector>,
    pub(crate) sink: Box<dyn DeliverySink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: watch::Sender<SubscriptionState>,
    pub(crate) deregister: Deregister,
}

enum Step {
    Record(RawRecord),
    Cancelled,
    Ended(FeedError),
}

impl FeedWatcher {
    /// Drives the subscription until it is cancelled, its sink goes away, or
    /// the feed fails.
    pub(crate) async fn run(self) {
        let FeedWatcher {
            channel_id,
            target,
            connector,
            mut sink,
            cancel,
            state,
            deregister,
        } = self;

        state.send_replace(SubscriptionState::Starting);
        log::debug!("[{}] opening change feed on {}/{}", channel_id, target.redacted_uri(), target.database);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("[{}] cancelled while starting", channel_id);
                state.send_replace(SubscriptionState::Closed);
                deregister();
                return;
            }
            opened = connector.open(&target) => opened,
        };

        let mut feed: Box<dyn ChangeFeed> = match opened {
            Ok(feed) => feed,
            Err(err) => {
                log::error!("[{}] could not open change feed: {}", channel_id, err);
                state.send_replace(SubscriptionState::Failed);
                deregister();
                sink.fail(err);
                return;
            }
        };

        state.send_replace(SubscriptionState::Active);
        log::info!("[{}] change feed active on database '{}'", channel_id, target.database);

        let mut forwarded: u64 = 0;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                next = feed.next_record() => match next {
                    Some(Ok(raw)) => Step::Record(raw),
                    Some(Err(err)) => Step::Ended(err),
                    None => Step::Ended(FeedError::transport("change stream closed by server")),
                },
            };

            match step {
                Step::Record(raw) => {
                    let event = canonicalize(&raw);
                    let pushed = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        pushed = sink.deliver(event) => Some(pushed),
                    };
                    match pushed {
                        Some(Ok(())) => forwarded += 1,
                        Some(Err(SinkClosed)) => {
                            log::info!("[{}] consumer went away after {} events, closing", channel_id, forwarded);
                            state.send_replace(SubscriptionState::Closing);
                            feed.close().await;
                            deregister();
                            state.send_replace(SubscriptionState::Closed);
                            return;
                        }
                        None => {
                            close_voluntarily(&channel_id, feed, &state, deregister, forwarded).await;
                            return;
                        }
                    }
                }
                Step::Cancelled => {
                    close_voluntarily(&channel_id, feed, &state, deregister, forwarded).await;
                    return;
                }
                Step::Ended(err) => {
                    log::warn!("[{}] change feed failed after {} events: {}", channel_id, forwarded, err);
                    feed.close().await;
                    state.send_replace(SubscriptionState::Failed);
                    deregister();
                    sink.fail(err);
                    return;
                }
            }
        }
    }
}

async fn close_voluntarily(
    channel_id: &str,
    feed: Box<dyn ChangeFeed>,
    state: &watch::Sender<SubscriptionState>,
    deregister: Deregister,
    forwarded: u64,
) {
    state.send_replace(SubscriptionState::Closing);
    feed.close().await;
    deregister();
    state.send_replace(SubscriptionState::Closed);
    log::info!("[{}] change feed closed after {} events", channel_id, forwarded);
}
