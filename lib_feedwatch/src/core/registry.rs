//! # Subscription Registry
//!
//! The table of live channels. Each entry owns the cancellation token, the
//! watcher task and a view of the subscription state for one channel id. At
//! most one entry exists per channel, because a second feed would deliver
//! every event twice to the same consumer.
//!
//! The map lock is only held for lookups and mutations, never across an
//! `.await`, so calls for different channels do not wait on each other. An
//! entry stays in the map while its channel is closing, which serializes a
//! re-subscribe behind the teardown of the previous feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::core::feed::{FeedConnector, TargetDescriptor};
use crate::core::sink::{channel_sink, DeliverySink, SubscriptionHandle};
use crate::core::watcher::{Deregister, FeedWatcher, SubscriptionState};
use crate::errors::SubscribeError;

/// How long `unsubscribe` waits for a watcher to release its feed before the
/// task is aborted and any in-flight events are dropped.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

struct Entry {
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<SubscriptionState>,
    closing: bool,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// # Registry
///
/// Explicit, constructible owner of every subscription. Independent instances
/// share nothing, which keeps tests isolated.
pub struct Registry {
    entries: Entries,
    connector: Arc<dyn FeedConnector>,
    next_generation: AtomicU64,
}

impl Registry {
    /// Creates an empty registry that opens feeds through `connector`.
    pub fn new(connector: Arc<dyn FeedConnector>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            connector,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Subscribes `channel_id` with an unbounded in-memory sink and returns the
    /// consumer handle. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, channel_id: &str, target: TargetDescriptor) -> Result<SubscriptionHandle, SubscribeError> {
        let (sink, handle) = channel_sink(channel_id);
        self.subscribe_with_sink(channel_id, target, Box::new(sink))?;
        Ok(handle)
    }

    /// Subscribes `channel_id`, delivering into a caller-supplied sink.
    ///
    /// Returns as soon as the watcher is scheduled. Connect failures arrive
    /// later on the sink's error stream.
    pub fn subscribe_with_sink(
        &self,
        channel_id: &str,
        target: TargetDescriptor,
        sink: Box<dyn DeliverySink>,
    ) -> Result<(), SubscribeError> {
        if channel_id.is_empty() {
            return Err(SubscribeError::EmptyChannelId);
        }
        target.validate()?;

        let mut entries = lock(&self.entries);
        if entries.contains_key(channel_id) {
            log::warn!("[{}] rejected duplicate subscription", channel_id);
            return Err(SubscribeError::AlreadySubscribed(channel_id.to_string()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Starting);

        let watcher = FeedWatcher {
            channel_id: channel_id.to_string(),
            target,
            connector: Arc::clone(&self.connector),
            sink,
            cancel: cancel.clone(),
            state: state_tx,
            deregister: deregister_fn(&self.entries, channel_id, generation),
        };

        // The entry is inserted before the lock is released, so a watcher that
        // stops immediately still finds it when deregistering.
        let task = tokio::spawn(watcher.run());
        entries.insert(
            channel_id.to_string(),
            Entry {
                generation,
                cancel,
                task: Some(task),
                state: state_rx,
                closing: false,
            },
        );
        log::info!("[{}] subscribed", channel_id);
        Ok(())
    }

    /// Stops a channel and releases its feed. Unknown, closing and already
    /// closed channels are a no-op. Waits at most `TEARDOWN_GRACE`.
    pub async fn unsubscribe(&self, channel_id: &str) {
        let (generation, cancel, task) = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(channel_id) {
                Some(entry) if !entry.closing => {
                    entry.closing = true;
                    (entry.generation, entry.cancel.clone(), entry.task.take())
                }
                _ => return,
            }
        };

        // Removes the entry even if the caller drops this future mid-teardown.
        let _remove = RemoveOnDrop {
            entries: &self.entries,
            channel_id,
            generation,
        };

        cancel.cancel();
        if let Some(mut task) = task {
            if timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
                log::warn!(
                    "[{}] watcher did not stop within {:?}, aborting; pending events are dropped",
                    channel_id,
                    TEARDOWN_GRACE
                );
                task.abort();
            }
        }

        log::info!("[{}] unsubscribed", channel_id);
    }

    /// Unsubscribes every channel concurrently.
    pub async fn shutdown(&self) {
        let channels = self.active_channels();
        join_all(channels.iter().map(|channel| self.unsubscribe(channel))).await;
    }

    /// Current lifecycle state of a channel, if it is registered.
    pub fn state(&self, channel_id: &str) -> Option<SubscriptionState> {
        lock(&self.entries)
            .get(channel_id)
            .map(|entry| *entry.state.borrow())
    }

    /// True while the channel is registered and not being torn down.
    pub fn is_active(&self, channel_id: &str) -> bool {
        lock(&self.entries)
            .get(channel_id)
            .is_some_and(|entry| !entry.closing)
    }

    /// Channels that are registered and not being torn down, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = lock(&self.entries)
            .iter()
            .filter(|(_, entry)| !entry.closing)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Number of registered channels, closing ones included.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True when no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Watchers close their feeds on their own once cancelled.
        for entry in lock(&self.entries).values() {
            entry.cancel.cancel();
        }
    }
}

/// The map stays structurally valid even if a holder panicked, so a poisoned
/// lock is recovered rather than propagated.
fn lock(entries: &Mutex<HashMap<String, Entry>>) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_generation(entries: &Mutex<HashMap<String, Entry>>, channel_id: &str, generation: u64) {
    let mut entries = lock(entries);
    if entries.get(channel_id).is_some_and(|e| e.generation == generation) {
        entries.remove(channel_id);
    }
}

struct RemoveOnDrop<'a> {
    entries: &'a Mutex<HashMap<String, Entry>>,
    channel_id: &'a str,
    generation: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        remove_generation(self.entries, self.channel_id, self.generation);
    }
}

fn deregister_fn(entries: &Entries, channel_id: &str, generation: u64) -> Deregister {
    let entries = Arc::clone(entries);
    let channel_id = channel_id.to_string();
    Box::new(move || remove_generation(&entries, &channel_id, generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::OperationKind;
    use crate::core::sink::Delivery;
    use crate::errors::FeedError;
    use crate::testing::MemoryConnector;
    use bson::doc;

    fn target() -> TargetDescriptor {
        TargetDescriptor::new("mongodb://x", "shop")
    }

    fn insert(key: &str) -> bson::Document {
        doc! {
            "operationType": "insert",
            "ns": { "db": "shop", "coll": "orders" },
            "documentKey": { "_id": key },
            "fullDocument": { "_id": key },
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn key_of(delivery: Option<Delivery>) -> String {
        match delivery {
            Some(Delivery::Event(event)) => event.document_key.unwrap_or_default(),
            other => panic!("expected an event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_empty_channel_and_blank_target() {
        let registry = Registry::new(Arc::new(MemoryConnector::new()));
        assert_eq!(registry.subscribe("", target()).err(), Some(SubscribeError::EmptyChannelId));
        assert!(matches!(
            registry.subscribe("ch1", TargetDescriptor::new("", "shop")).err(),
            Some(SubscribeError::InvalidTarget(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected_and_first_keeps_flowing() {
        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector.clone()));

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        assert_eq!(
            registry.subscribe("ch1", target()).err(),
            Some(SubscribeError::AlreadySubscribed("ch1".into()))
        );

        feed.push(insert("a"));
        assert_eq!(key_of(handle.next().await), "a");
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn records_arrive_in_feed_order() {
        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));
        let mut handle = registry.subscribe("ch1", target()).unwrap();

        let keys = ["r1", "r2", "r3", "r4", "r5"];
        for key in keys {
            feed.push(insert(key));
        }
        for key in keys {
            assert_eq!(key_of(handle.next().await), key);
        }
    }

    #[tokio::test]
    async fn unsubscribe_releases_feed_and_allows_resubscribe() {
        let connector = MemoryConnector::new();
        let first = connector.script_feed();
        let second = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;

        registry.unsubscribe("ch1").await;
        assert!(first.is_released());
        assert!(!registry.is_active("ch1"));
        assert_eq!(handle.next().await, None);

        let mut again = registry.subscribe("ch1", target()).unwrap();
        second.push(insert("b"));
        assert_eq!(key_of(again.next().await), "b");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_silent() {
        let connector = MemoryConnector::new();
        let _feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        registry.unsubscribe("never-subscribed").await;

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        registry.unsubscribe("ch1").await;
        registry.unsubscribe("ch1").await;
        assert_eq!(handle.next().await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_while_starting_cancels_the_open() {
        let connector = MemoryConnector::new();
        connector.script_pending();
        let registry = Registry::new(Arc::new(connector));

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        assert_eq!(registry.state("ch1"), Some(SubscriptionState::Starting));

        tokio::time::timeout(TEARDOWN_GRACE, registry.unsubscribe("ch1"))
            .await
            .expect("unsubscribe must not wait for the open");
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn connect_failure_is_reported_once_and_deregistered() {
        let connector = MemoryConnector::new();
        connector.script_refusal("server selection timeout");
        let registry = Registry::new(Arc::new(connector));

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        assert_eq!(
            handle.next().await,
            Some(Delivery::Failed(FeedError::connect("server selection timeout")))
        );
        assert_eq!(handle.next().await, None);
        assert!(!registry.is_active("ch1"));
    }

    #[tokio::test]
    async fn transport_failure_ends_channel_after_delivered_events() {
        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));
        let mut handle = registry.subscribe("ch1", target()).unwrap();

        feed.push(insert("a"));
        feed.push(insert("b"));
        feed.fail("connection reset");
        feed.push(insert("c"));

        assert_eq!(key_of(handle.next().await), "a");
        assert_eq!(key_of(handle.next().await), "b");
        assert_eq!(
            handle.next().await,
            Some(Delivery::Failed(FeedError::transport("connection reset")))
        );
        assert_eq!(handle.next().await, None);
        assert!(feed.is_released());
        assert!(registry.active_channels().is_empty());
    }

    #[tokio::test]
    async fn server_closing_the_stream_is_a_transport_failure() {
        let connector = MemoryConnector::new();
        let mut feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));
        let mut handle = registry.subscribe("ch1", target()).unwrap();

        feed.end();
        match handle.next().await {
            Some(Delivery::Failed(FeedError::Transport(_))) => {}
            other => panic!("expected a transport failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failure_on_one_channel_leaves_others_running() {
        let connector = MemoryConnector::new();
        let failing = connector.script_feed();
        let healthy = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let mut h1 = registry.subscribe("ch1", target()).unwrap();
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;
        let mut h2 = registry.subscribe("ch2", target()).unwrap();

        failing.fail("boom");
        assert!(matches!(h1.next().await, Some(Delivery::Failed(_))));

        healthy.push(insert("still-here"));
        assert_eq!(key_of(h2.next().await), "still-here");
        assert_eq!(registry.active_channels(), vec!["ch2".to_string()]);
    }

    #[tokio::test]
    async fn consumer_leaving_closes_the_channel() {
        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let handle = registry.subscribe("ch1", target()).unwrap();
        drop(handle);
        feed.push(insert("orphan"));

        wait_until(|| registry.is_empty()).await;
        assert!(feed.is_released());
    }

    #[tokio::test]
    async fn callback_sink_receives_canonical_events() {
        use crate::core::sink::CallbackSink;
        use std::sync::Mutex as StdMutex;

        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let sink = CallbackSink::new(
            move |event: crate::canonical::CanonicalEvent| {
                seen_in.lock().unwrap().push(event.operation_kind);
                Ok(())
            },
            |_err: FeedError| {},
        );
        registry.subscribe_with_sink("ch1", target(), Box::new(sink)).unwrap();

        feed.push(insert("a"));
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(*seen.lock().unwrap(), vec![OperationKind::Insert]);
    }

    #[tokio::test]
    async fn shutdown_closes_every_channel() {
        let connector = MemoryConnector::new();
        let a = connector.script_feed();
        let b = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let _h1 = registry.subscribe("ch1", target()).unwrap();
        let _h2 = registry.subscribe("ch2", target()).unwrap();
        wait_until(|| registry.state("ch2") == Some(SubscriptionState::Active)).await;
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(a.is_released() && b.is_released());
    }

    #[tokio::test]
    async fn abandoned_unsubscribe_still_frees_the_channel() {
        use futures_util::FutureExt;

        let connector = MemoryConnector::new();
        let first = connector.script_feed();
        let second = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let _old = registry.subscribe("ch1", target()).unwrap();
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;

        // One poll cancels the watcher, then the caller gives up.
        assert!(registry.unsubscribe("ch1").now_or_never().is_none());
        assert!(!registry.is_active("ch1"));
        wait_until(|| first.is_released()).await;
        wait_until(|| registry.is_empty()).await;

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        second.push(insert("after"));
        assert_eq!(key_of(handle.next().await), "after");
    }

    #[tokio::test]
    async fn cancelled_watcher_removes_its_own_entry() {
        let connector = MemoryConnector::new();
        let feed = connector.script_feed();
        let registry = Registry::new(Arc::new(connector));

        let _handle = registry.subscribe("ch1", target()).unwrap();
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;

        // Cancel the watcher directly, bypassing unsubscribe.
        if let Some(entry) = lock(&registry.entries).get("ch1") {
            entry.cancel.cancel();
        }
        wait_until(|| registry.is_empty()).await;
        assert!(feed.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_gives_up_after_the_grace_period() {
        let connector = MemoryConnector::new();
        let feed = connector.script_stuck_feed();
        let registry = Registry::new(Arc::new(connector));

        let mut handle = registry.subscribe("ch1", target()).unwrap();
        wait_until(|| registry.state("ch1") == Some(SubscriptionState::Active)).await;

        let started = tokio::time::Instant::now();
        registry.unsubscribe("ch1").await;
        assert!(started.elapsed() >= TEARDOWN_GRACE);
        assert!(registry.is_empty());

        // The aborted task drops the sink and the feed it was closing.
        assert_eq!(handle.next().await, None);
        assert!(feed.is_released());
    }
}
