//! # Registry Scenarios
//!
//! End-to-end runs of the multiplexer through the public API: subscribe,
//! deliver, fail, unsubscribe, and view. Every feed is scripted through
//! `MemoryConnector`, so no database is needed.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, oid::ObjectId};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lib_feedwatch::testing::MemoryConnector;
use lib_feedwatch::{
    canonicalize, Delivery, EventLog, FeedError, FilterSpec, OperationKind, Registry, SubscribeError,
    SubscriptionHandle, TargetDescriptor,
};
use project_tests::{record, settle, shop};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next(handle: &mut SubscriptionHandle) -> Option<Delivery> {
    timeout(WAIT, handle.next()).await.expect("delivery timed out")
}

#[tokio::test]
async fn insert_on_ch1_yields_one_canonical_event() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector.clone()));

    let mut handle = registry.subscribe("ch1", shop()).unwrap();
    assert!(feed.push(record("insert", "orders", "X", 1_714_557_600)));

    match next(&mut handle).await {
        Some(Delivery::Event(event)) => {
            assert_eq!(event.operation_kind, OperationKind::Insert);
            assert_eq!(event.collection_name.as_deref(), Some("orders"));
            assert_eq!(event.document_key.as_deref(), Some("X"));
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["occurredAt"], "2024-05-01T10:00:00.000Z");
            let parsed = DateTime::parse_from_rfc3339(json["occurredAt"].as_str().unwrap()).unwrap();
            assert_eq!(parsed.with_timezone(&Utc), event.occurred_at);
        }
        other => panic!("expected one insert event, got {:?}", other),
    }
    assert!(timeout(Duration::from_millis(50), handle.next()).await.is_err());
    assert_eq!(connector.opened_targets(), vec![shop()]);

    registry.unsubscribe("ch1").await;
}

#[tokio::test]
async fn object_ids_are_keyed_by_their_hex_string() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));
    let mut handle = registry.subscribe("ch1", shop()).unwrap();

    let oid = ObjectId::parse_str("65f1c0ffee00000000000001").unwrap();
    feed.push(doc! {
        "operationType": "delete",
        "ns": { "db": "shop", "coll": "orders" },
        "documentKey": { "_id": oid },
    });

    match next(&mut handle).await {
        Some(Delivery::Event(event)) => {
            assert_eq!(event.operation_kind, OperationKind::Delete);
            assert_eq!(event.document_key.as_deref(), Some("65f1c0ffee00000000000001"));
            assert_eq!(event.full_document, None);
        }
        other => panic!("expected a delete event, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_then_unsubscribe_then_resubscribe() {
    let connector = MemoryConnector::new();
    let first = connector.script_feed();
    let second = connector.script_feed();
    let registry = Registry::new(Arc::new(connector.clone()));

    let mut handle = registry.subscribe("ch1", shop()).unwrap();
    assert_eq!(
        registry.subscribe("ch1", shop()).err(),
        Some(SubscribeError::AlreadySubscribed("ch1".to_string()))
    );

    first.push(record("insert", "orders", "1", 100));
    assert!(matches!(next(&mut handle).await, Some(Delivery::Event(_))));

    registry.unsubscribe("ch1").await;
    assert!(first.is_released());
    assert!(!registry.is_active("ch1"));

    let mut again = registry.subscribe("ch1", shop()).unwrap();
    second.push(record("update", "orders", "1", 101));
    match next(&mut again).await {
        Some(Delivery::Event(event)) => assert_eq!(event.operation_kind, OperationKind::Update),
        other => panic!("expected an update event, got {:?}", other),
    }
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test]
async fn transport_drop_after_two_events() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));
    let mut handle = registry.subscribe("ch1", shop()).unwrap();
    settle(|| registry.is_active("ch1")).await;

    feed.push(record("insert", "orders", "1", 100));
    feed.push(record("insert", "orders", "2", 101));
    feed.fail("connection reset by peer");
    feed.push(record("insert", "orders", "3", 102));

    let mut keys = Vec::new();
    let mut errors = Vec::new();
    while let Some(delivery) = next(&mut handle).await {
        match delivery {
            Delivery::Event(event) => keys.push(event.document_key),
            Delivery::Failed(error) => errors.push(error),
        }
    }

    assert_eq!(keys, vec![Some("1".to_string()), Some("2".to_string())]);
    assert_eq!(errors, vec![FeedError::Transport("connection reset by peer".to_string())]);
    assert!(!registry.active_channels().contains(&"ch1".to_string()));
    assert!(feed.is_released());
}

#[tokio::test]
async fn order_is_preserved_across_a_burst() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));
    let handle = registry.subscribe("ch1", shop()).unwrap();

    for i in 0..50u32 {
        feed.push(record("insert", &format!("c{}", i % 3), &i.to_string(), 1_000 + i));
    }

    let received: Vec<String> = handle
        .into_stream()
        .take(50)
        .filter_map(|d| async move {
            match d {
                Delivery::Event(event) => event.document_key,
                Delivery::Failed(_) => None,
            }
        })
        .collect()
        .await;
    let expected: Vec<String> = (0..50).map(|i: u32| i.to_string()).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn unsubscribe_is_idempotent_and_silent() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));

    registry.unsubscribe("never-subscribed").await;

    let mut handle = registry.subscribe("ch1", shop()).unwrap();
    registry.unsubscribe("ch1").await;
    registry.unsubscribe("ch1").await;

    assert_eq!(next(&mut handle).await, None);
    assert!(feed.is_released());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn connect_failure_is_isolated_to_its_channel() {
    let connector = MemoryConnector::new();
    connector.script_refusal("server selection timeout");
    let healthy = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));

    let mut broken = registry.subscribe("bad", TargetDescriptor::new("mongodb://nowhere", "shop")).unwrap();
    assert_eq!(
        next(&mut broken).await,
        Some(Delivery::Failed(FeedError::ConnectFailed("server selection timeout".to_string())))
    );
    assert_eq!(next(&mut broken).await, None);

    let mut good = registry.subscribe("good", shop()).unwrap();
    healthy.push(record("replace", "users", "u1", 200));
    match next(&mut good).await {
        Some(Delivery::Event(event)) => assert_eq!(event.operation_kind, OperationKind::Replace),
        other => panic!("expected a replace event, got {:?}", other),
    }
    assert_eq!(registry.active_channels(), vec!["good".to_string()]);
}

#[tokio::test]
async fn retained_log_serves_filtered_views() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));
    let mut handle = registry.subscribe("ch1", shop()).unwrap();

    feed.push(record("insert", "orders", "1", 100));
    feed.push(record("insert", "users", "2", 101));
    feed.push(record("update", "orders", "1", 102));
    feed.push(record("delete", "orders", "3", 103));

    let mut history = EventLog::new();
    for _ in 0..4 {
        let delivery = next(&mut handle).await.expect("event");
        history.ingest(delivery);
    }

    let orders_only = FilterSpec::new().with_collections(["orders"]);
    let keys: Vec<_> = history
        .view(&orders_only)
        .iter()
        .map(|e| e.document_key.clone().unwrap_or_default())
        .collect();
    assert_eq!(keys, vec!["3", "1", "1"]);

    let narrowed = FilterSpec::new()
        .with_operations([OperationKind::Insert])
        .with_document_key("2");
    assert_eq!(history.view(&narrowed).len(), 1);

    // Dropping the filter brings everything back.
    assert_eq!(history.view(&FilterSpec::new()).len(), 4);
    assert_eq!(history.events().len(), 4);

    registry.unsubscribe("ch1").await;
}

#[tokio::test]
async fn delivered_events_are_already_canonical() {
    let connector = MemoryConnector::new();
    let feed = connector.script_feed();
    let registry = Registry::new(Arc::new(connector));
    let mut handle = registry.subscribe("ch1", shop()).unwrap();

    let raw = record("insert", "orders", "X", 1_714_557_600);
    feed.push(raw.clone());

    let Some(Delivery::Event(delivered)) = next(&mut handle).await else {
        panic!("expected an event");
    };
    let direct = canonicalize(&raw);
    assert_eq!(delivered.operation_kind, direct.operation_kind);
    assert_eq!(delivered.document_key, direct.document_key);
    assert_eq!(delivered.occurred_at, direct.occurred_at);
    assert_eq!(delivered.full_document, direct.full_document);
}

#[tokio::test]
async fn shutdown_releases_every_channel() {
    let connector = MemoryConnector::new();
    let feeds: Vec<_> = (0..3).map(|_| connector.script_feed()).collect();
    let registry = Registry::new(Arc::new(connector));

    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|ch| registry.subscribe(ch, shop()).unwrap())
        .collect();
    settle(|| registry.active_channels().len() == 3).await;

    registry.shutdown().await;
    assert!(registry.is_empty());
    assert!(feeds.iter().all(|f| f.is_released()));
    drop(handles);
}
