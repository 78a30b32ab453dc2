//! # In-Memory Feed Connector
//!
//! A scripted `FeedConnector` for exercising the registry without a database.
//! Each call to `open` consumes the next scripted outcome in FIFO order:
//!
//! - `script_feed` yields a live feed driven through the returned `FeedController`
//! - `script_refusal` makes the open fail with `ConnectFailed`
//! - `script_pending` makes the open hang until the subscription is cancelled
//! - `script_stuck_feed` yields a live feed whose `close` never completes
//!
//! With nothing scripted, `open` fails with `ConnectFailed`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{self, BoxFuture};
use tokio::sync::mpsc;

use crate::canonical::RawRecord;
use crate::core::feed::{ChangeFeed, FeedConnector, TargetDescriptor};
use crate::errors::FeedError;

enum Script {
    Feed {
        records: mpsc::UnboundedReceiver<Result<RawRecord, FeedError>>,
        released: Arc<AtomicBool>,
        stuck_on_close: bool,
    },
    Refuse(String),
    Pending,
}

/// Scripted connector. Cheap to clone; clones share the script queue.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    opened: Arc<AtomicUsize>,
    targets: Arc<Mutex<Vec<TargetDescriptor>>>,
}

impl MemoryConnector {
    /// Creates a connector with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful open and returns the controller driving that feed.
    pub fn script_feed(&self) -> FeedController {
        self.script_live(false)
    }

    /// Queues a successful open of a feed that hangs when closed. It is only
    /// released when the watcher task is dropped.
    pub fn script_stuck_feed(&self) -> FeedController {
        self.script_live(true)
    }

    fn script_live(&self, stuck_on_close: bool) -> FeedController {
        let (tx, records) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        self.push(Script::Feed {
            records,
            released: Arc::clone(&released),
            stuck_on_close,
        });
        FeedController { tx: Some(tx), released }
    }

    /// Queues an open that fails with `ConnectFailed(reason)`.
    pub fn script_refusal(&self, reason: &str) {
        self.push(Script::Refuse(reason.to_string()));
    }

    /// Queues an open that never completes.
    pub fn script_pending(&self) {
        self.push(Script::Pending);
    }

    /// How many times `open` has been called.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Targets passed to `open`, in call order.
    pub fn opened_targets(&self) -> Vec<TargetDescriptor> {
        self.targets.lock().map(|t| t.clone()).unwrap_or_default()
    }

    fn push(&self, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push_back(script);
        }
    }
}

impl FeedConnector for MemoryConnector {
    fn open(&self, target: &TargetDescriptor) -> BoxFuture<'static, Result<Box<dyn ChangeFeed>, FeedError>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(target.clone());
        }
        let next = self.scripts.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Script::Feed {
                records,
                released,
                stuck_on_close,
            }) => {
                let feed: Box<dyn ChangeFeed> = Box::new(MemoryFeed {
                    records,
                    released,
                    stuck_on_close,
                });
                Box::pin(future::ready(Ok(feed)))
            }
            Some(Script::Refuse(reason)) => Box::pin(future::ready(Err(FeedError::connect(reason)))),
            Some(Script::Pending) => Box::pin(future::pending()),
            None => Box::pin(future::ready(Err(FeedError::connect("no scripted feed")))),
        }
    }
}

struct MemoryFeed {
    records: mpsc::UnboundedReceiver<Result<RawRecord, FeedError>>,
    released: Arc<AtomicBool>,
    stuck_on_close: bool,
}

impl ChangeFeed for MemoryFeed {
    fn next_record(&mut self) -> BoxFuture<'_, Option<Result<RawRecord, FeedError>>> {
        Box::pin(self.records.recv())
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        if self.stuck_on_close {
            // The feed lives inside the pending future, so only dropping the
            // future releases it.
            return Box::pin(async move {
                let _feed = self;
                future::pending::<()>().await
            });
        }
        self.released.store(true, Ordering::SeqCst);
        Box::pin(future::ready(()))
    }
}

impl Drop for MemoryFeed {
    fn drop(&mut self) {
        // An aborted watcher drops the feed without closing it.
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Test-side driver of one scripted feed.
pub struct FeedController {
    tx: Option<mpsc::UnboundedSender<Result<RawRecord, FeedError>>>,
    released: Arc<AtomicBool>,
}

impl FeedController {
    /// Delivers a raw record. Returns false once the feed is gone.
    pub fn push(&self, record: RawRecord) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(Ok(record)).is_ok())
    }

    /// Drops the transport with `reason`.
    pub fn fail(&self, reason: &str) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(Err(FeedError::transport(reason))).is_ok())
    }

    /// Ends the stream as if the server closed it.
    pub fn end(&mut self) {
        self.tx = None;
    }

    /// True once the watcher has closed or dropped the feed.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
