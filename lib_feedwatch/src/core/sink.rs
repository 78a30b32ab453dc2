//! # Delivery Sink
//!
//! The per-channel output boundary. A sink has two outputs: a FIFO event
//! stream and a single terminal error. `fail` consumes the sink, so a channel
//! can report at most one error, and after it no event can follow.
//!
//! `channel_sink` builds the pull-style pair used by most callers: a
//! `ChannelSink` handed to the watcher and a `SubscriptionHandle` kept by the
//! consumer. `CallbackSink` is the push-style alternative.

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};

use crate::canonical::CanonicalEvent;
use crate::errors::{FeedError, SinkClosed};

/// The write side of a channel's output. The watcher is its only writer.
pub trait DeliverySink: Send + 'static {
    /// Pushes one event. Fails once the consumer has gone away.
    fn deliver(&mut self, event: CanonicalEvent) -> BoxFuture<'_, Result<(), SinkClosed>>;

    /// Reports the terminal error and closes the event stream.
    fn fail(self: Box<Self>, error: FeedError);
}

/// One item observed by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A canonical event, in feed arrival order.
    Event(CanonicalEvent),
    /// The terminal error. Nothing follows it.
    Failed(FeedError),
}

enum EventSender {
    Unbounded(mpsc::UnboundedSender<CanonicalEvent>),
    Bounded(mpsc::Sender<CanonicalEvent>),
}

enum EventReceiver {
    Unbounded(mpsc::UnboundedReceiver<CanonicalEvent>),
    Bounded(mpsc::Receiver<CanonicalEvent>),
}

impl EventReceiver {
    async fn recv(&mut self) -> Option<CanonicalEvent> {
        match self {
            EventReceiver::Unbounded(rx) => rx.recv().await,
            EventReceiver::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Queue-backed sink feeding a `SubscriptionHandle`.
pub struct ChannelSink {
    events: EventSender,
    error: oneshot::Sender<FeedError>,
}

/// Creates an unbounded sink and its consumer handle.
pub fn channel_sink(channel_id: &str) -> (ChannelSink, SubscriptionHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    build(
        channel_id,
        EventSender::Unbounded(event_tx),
        EventReceiver::Unbounded(event_rx),
    )
}

/// Creates a sink whose event queue holds at most `capacity` events. The
/// watcher waits for room instead of dropping events.
pub fn bounded_channel_sink(channel_id: &str, capacity: usize) -> (ChannelSink, SubscriptionHandle) {
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    build(
        channel_id,
        EventSender::Bounded(event_tx),
        EventReceiver::Bounded(event_rx),
    )
}

fn build(channel_id: &str, events: EventSender, receiver: EventReceiver) -> (ChannelSink, SubscriptionHandle) {
    let (error_tx, error_rx) = oneshot::channel();
    let sink = ChannelSink {
        events,
        error: error_tx,
    };
    let handle = SubscriptionHandle {
        channel_id: channel_id.to_string(),
        events: receiver,
        error: Some(error_rx),
    };
    (sink, handle)
}

impl DeliverySink for ChannelSink {
    fn deliver(&mut self, event: CanonicalEvent) -> BoxFuture<'_, Result<(), SinkClosed>> {
        match &self.events {
            EventSender::Unbounded(tx) => Box::pin(future::ready(tx.send(event).map_err(|_| SinkClosed))),
            EventSender::Bounded(tx) => Box::pin(async move { tx.send(event).await.map_err(|_| SinkClosed) }),
        }
    }

    fn fail(self: Box<Self>, error: FeedError) {
        let ChannelSink { events, error: error_tx } = *self;
        // The error must be in place before the event stream reports its end.
        let _ = error_tx.send(error);
        drop(events);
    }
}

/// # Subscription Handle
///
/// The consumer side of a channel. Events come out in arrival order; once the
/// stream ends, the terminal error (if any) is returned exactly once.
pub struct SubscriptionHandle {
    channel_id: String,
    events: EventReceiver,
    error: Option<oneshot::Receiver<FeedError>>,
}

impl SubscriptionHandle {
    /// The channel this handle reads from.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Waits for the next delivery. `None` means the channel ended without an
    /// error, i.e. it was unsubscribed.
    pub async fn next(&mut self) -> Option<Delivery> {
        if let Some(event) = self.events.recv().await {
            return Some(Delivery::Event(event));
        }
        let error_rx = self.error.take()?;
        error_rx.await.ok().map(Delivery::Failed)
    }

    /// Converts the handle into a stream of deliveries.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send {
        stream::unfold(self, |mut handle| async move {
            handle.next().await.map(|delivery| (delivery, handle))
        })
    }
}

/// Push-style sink that hands events and the terminal error to closures.
pub struct CallbackSink<E, F> {
    on_event: E,
    on_error: F,
}

impl<E, F> CallbackSink<E, F>
where
    E: FnMut(CanonicalEvent) -> Result<(), SinkClosed> + Send + 'static,
    F: FnOnce(FeedError) + Send + 'static,
{
    /// `on_event` returns `Err(SinkClosed)` to stop the subscription.
    pub fn new(on_event: E, on_error: F) -> Self {
        Self { on_event, on_error }
    }
}

impl<E, F> DeliverySink for CallbackSink<E, F>
where
    E: FnMut(CanonicalEvent) -> Result<(), SinkClosed> + Send + 'static,
    F: FnOnce(FeedError) + Send + 'static,
{
    fn deliver(&mut self, event: CanonicalEvent) -> BoxFuture<'_, Result<(), SinkClosed>> {
        Box::pin(future::ready((self.on_event)(event)))
    }

    fn fail(self: Box<Self>, error: FeedError) {
        (self.on_error)(error);
    }
}
