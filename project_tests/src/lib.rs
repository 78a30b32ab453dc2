//! Shared fixtures for the end-to-end scenario tests.

use std::time::Duration;

use bson::{doc, Document, Timestamp};
use lib_feedwatch::TargetDescriptor;

/// The `shop` database on a throwaway host.
pub fn shop() -> TargetDescriptor {
    TargetDescriptor::new("mongodb://x", "shop")
}

/// A raw change record as the server would send it.
pub fn record(op: &str, coll: &str, id: &str, cluster_secs: u32) -> Document {
    doc! {
        "operationType": op,
        "ns": { "db": "shop", "coll": coll },
        "documentKey": { "_id": id },
        "clusterTime": Timestamp { time: cluster_secs, increment: 1 },
        "fullDocument": { "_id": id, "status": "new" },
    }
}

/// Polls `check` for up to one second.
pub async fn settle<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}
