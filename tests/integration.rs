//! Integration tests for the full sync path: device outbox → coordinator →
//! event log → catch-up feed → device snapshot.
//!
//! Backends are local (in-memory stores and temp SQLite files), so the
//! whole suite runs with a plain `cargo test --test integration`.
//!
//! # Test Organization
//! - `happy_*` - normal operation: offline queueing, catch-up, idempotency
//! - `failure_*` - conflicts, dead-lettering, transport outages

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use pos_sync::client::{OutboxStore, SnapshotStore};
use pos_sync::event::{EventScope, EventType};
use pos_sync::payload::ResourceKind;
use pos_sync::{
    ClientEvent, CycleOutcome, InMemoryEventLog, InMemoryResources, InProcessTransport,
    MemoryLocalStore, NewQueueItem, PushResponse, SqlEventLog, SqliteLocalStore, SyncConfig,
    SyncCoordinator, SyncEvent, SyncTransport, SyncWorker, TransportError,
};

// =============================================================================
// Helpers
// =============================================================================

fn temp_db_path(name: &str) -> PathBuf {
    // Use local temp/ folder (gitignored) instead of system temp
    let _ = std::fs::create_dir_all("temp");
    PathBuf::from("temp").join(format!("integration_{}.db", name))
}

/// Clean up SQLite database and its WAL files
fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
}

fn memory_coordinator() -> Arc<SyncCoordinator> {
    Arc::new(SyncCoordinator::new(
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryResources::new()),
        SyncConfig::default(),
    ))
}

fn scope(device: &str) -> EventScope {
    EventScope::new("t1", "u1", device)
}

fn worker_with(
    coordinator: Arc<SyncCoordinator>,
    device: &str,
) -> (SyncWorker, Arc<MemoryLocalStore>, watch::Sender<bool>) {
    let store = Arc::new(MemoryLocalStore::new());
    let (online_tx, online_rx) = watch::channel(true);
    let worker = SyncWorker::new(
        store.clone(),
        Arc::new(InProcessTransport::new(coordinator)),
        scope(device),
        SyncConfig::default(),
        online_rx,
    );
    (worker, store, online_tx)
}

fn create_product(id: &str, name: &str) -> NewQueueItem {
    NewQueueItem {
        event_type: EventType::Create,
        resource_kind: ResourceKind::Product,
        resource_id: id.to_string(),
        payload: json!({"sku": id, "name": name, "price_cents": 350}),
    }
}

fn update_product(id: &str, name: &str, expected_version: i64) -> NewQueueItem {
    NewQueueItem {
        event_type: EventType::Update,
        resource_kind: ResourceKind::Product,
        resource_id: id.to_string(),
        payload: json!({
            "sku": id, "name": name, "price_cents": 400,
            "expected_version": expected_version
        }),
    }
}

// =============================================================================
// Happy Path Tests
// =============================================================================

#[tokio::test]
async fn happy_offline_sale_reaches_server_on_reconnect() {
    let coordinator = memory_coordinator();
    let (worker, store, online) = worker_with(coordinator.clone(), "till-1");

    // Offline: the sale is queued, nothing reaches the server
    online.send(false).unwrap();
    store
        .enqueue(NewQueueItem {
            event_type: EventType::Create,
            resource_kind: ResourceKind::Sale,
            resource_id: "sale-1".to_string(),
            payload: json!({
                "location_id": "shop-1",
                "lines": [{"product_id": "p1", "quantity": 1, "unit_price_cents": 350}],
                "total_cents": 350,
            }),
        })
        .await
        .unwrap();
    assert_eq!(worker.trigger().await.unwrap(), CycleOutcome::Offline);
    assert_eq!(store.queue_depth().await.unwrap(), 1);

    // Reconnect: one cycle drains the queue and applies the sale
    online.send(true).unwrap();
    let outcome = worker.trigger().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { settled: 1, merged: 1 });

    let record = coordinator
        .resources()
        .get("t1", ResourceKind::Sale, "sale-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.data["total_cents"], 350);
}

#[tokio::test]
async fn happy_resubmitted_batch_applies_once() {
    // The scenario where an ack is lost: the same batch is pushed twice
    let coordinator = memory_coordinator();
    let device = scope("till-1");

    let batch = vec![ClientEvent {
        idempotency_token: "tok-1".to_string(),
        event_type: "create".to_string(),
        resource_type: "inventory_item".to_string(),
        resource_id: "inv-1".to_string(),
        payload: json!({"product_id": "p1", "location_id": "shop-1", "quantity": 10}),
    }];

    let first = coordinator
        .push_events(&device, batch.clone(), None)
        .await
        .unwrap();
    let second = coordinator.push_events(&device, batch, None).await.unwrap();

    assert_eq!(first.synced_count, 1);
    assert_eq!(second.synced_count, 1);

    // Applied exactly once: still version 1, and one feed entry
    let record = coordinator
        .resources()
        .get("t1", ResourceKind::InventoryItem, "inv-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 1);
    let feed = coordinator.events_since("t1", 0, None).await.unwrap();
    assert_eq!(feed.len(), 1);
}

#[tokio::test]
async fn happy_catchup_feed_never_skips_or_repeats() {
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryResources::new()),
        SyncConfig {
            catchup_limit: 4,
            ..SyncConfig::default()
        },
    ));

    let (producer, producer_store, _o) = worker_with(coordinator.clone(), "till-1");
    for i in 0..10 {
        producer_store
            .enqueue(create_product(&format!("p{}", i), "N"))
            .await
            .unwrap();
    }
    producer.trigger().await.unwrap();

    // Consumer pages through the feed with the cursor protocol
    let mut cursor = 0i64;
    let mut seen: Vec<i64> = Vec::new();
    loop {
        let page = coordinator.events_since("t1", cursor, None).await.unwrap();
        if page.is_empty() {
            break;
        }
        assert!(page.len() <= 4);
        cursor = page.last().unwrap().id;
        seen.extend(page.iter().map(|e| e.id));
    }

    assert_eq!(seen.len(), 10);
    let mut deduped = seen.clone();
    deduped.dedup();
    assert_eq!(deduped, seen, "no repeats");
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "acceptance order");
}

#[tokio::test]
async fn happy_two_devices_converge_through_worker_cycles() {
    let coordinator = memory_coordinator();
    let (till_a, store_a, _oa) = worker_with(coordinator.clone(), "till-a");
    let (till_b, store_b, _ob) = worker_with(coordinator.clone(), "till-b");

    store_a.enqueue(create_product("p1", "Espresso")).await.unwrap();
    till_a.trigger().await.unwrap();
    till_b.trigger().await.unwrap();

    // B updates using the version it merged
    let seen = store_b.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    store_b
        .enqueue(update_product("p1", "Doppio", seen.version))
        .await
        .unwrap();
    till_b.trigger().await.unwrap();
    till_a.trigger().await.unwrap();

    let row_a = store_a.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    let row_b = store_b.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    assert_eq!(row_a, row_b);
    assert_eq!(row_a.version, 2);
    assert_eq!(row_a.data["name"], "Doppio");
}

#[tokio::test]
async fn happy_full_sqlite_stack_round_trip() {
    // Server log and device store both on real SQLite files
    let server_db = temp_db_path("server");
    let client_db = temp_db_path("client");
    cleanup_db(&server_db);
    cleanup_db(&client_db);

    let log = SqlEventLog::new(&format!("sqlite://{}?mode=rwc", server_db.display()))
        .await
        .unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(log),
        Arc::new(InMemoryResources::new()),
        SyncConfig::default(),
    ));

    let store = Arc::new(
        SqliteLocalStore::new(&format!("sqlite://{}?mode=rwc", client_db.display()))
            .await
            .unwrap(),
    );
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = SyncWorker::new(
        store.clone(),
        Arc::new(InProcessTransport::new(coordinator.clone())),
        scope("till-1"),
        SyncConfig::default(),
        online_rx,
    );

    store.enqueue(create_product("p1", "Espresso")).await.unwrap();
    let outcome = worker.trigger().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { settled: 1, merged: 1 });

    // Everything survived on disk
    let row = store.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    assert_eq!(row.version, 1);
    let checkpoint = store.checkpoint().await.unwrap();
    assert!(checkpoint.last_seen_event_id > 0);
    let feed = coordinator.events_since("t1", 0, None).await.unwrap();
    assert_eq!(feed.len(), 1);

    cleanup_db(&server_db);
    cleanup_db(&client_db);
}

#[tokio::test]
async fn happy_status_reflects_queue_and_conflicts() {
    let coordinator = memory_coordinator();
    let device = scope("till-1");

    coordinator
        .push_events(
            &device,
            vec![ClientEvent {
                idempotency_token: "tok-1".to_string(),
                event_type: "create".to_string(),
                resource_type: "product".to_string(),
                resource_id: "p1".to_string(),
                payload: json!({"sku": "p1", "name": "N", "price_cents": 100}),
            }],
            None,
        )
        .await
        .unwrap();

    // A stale update leaves a failed event behind
    coordinator
        .push_events(
            &device,
            vec![ClientEvent {
                idempotency_token: "tok-2".to_string(),
                event_type: "update".to_string(),
                resource_type: "product".to_string(),
                resource_id: "p1".to_string(),
                payload: json!({"sku": "p1", "name": "N", "price_cents": 100, "expected_version": 9}),
            }],
            None,
        )
        .await
        .unwrap();

    let status = coordinator.status("t1").await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.conflict_count, 1);
    assert_eq!(status.conflicts.len(), 1);
    assert_eq!(status.conflicts[0].kind, "stale_version");

    // Another tenant sees none of it
    let other = coordinator.status("t2").await.unwrap();
    assert_eq!(other.conflict_count, 0);
    assert!(other.conflicts.is_empty());
}

// =============================================================================
// Failure Scenario Tests
// =============================================================================

#[tokio::test]
async fn failure_concurrent_updates_one_wins_one_conflicts() {
    let coordinator = memory_coordinator();
    let (seed, seed_store, _os) = worker_with(coordinator.clone(), "till-0");
    seed_store.enqueue(create_product("p1", "Espresso")).await.unwrap();
    seed.trigger().await.unwrap();

    let (till_a, store_a, _oa) = worker_with(coordinator.clone(), "till-a");
    let (till_b, store_b, _ob) = worker_with(coordinator.clone(), "till-b");
    till_a.trigger().await.unwrap();
    till_b.trigger().await.unwrap();

    // Both edit against version 1
    store_a.enqueue(update_product("p1", "A wins", 1)).await.unwrap();
    store_b.enqueue(update_product("p1", "B wins", 1)).await.unwrap();

    let (ra, rb) = tokio::join!(till_a.trigger(), till_b.trigger());
    ra.unwrap();
    rb.unwrap();

    let conflicts_a = till_a.drain_conflicts();
    let conflicts_b = till_b.drain_conflicts();
    assert_eq!(
        conflicts_a.len() + conflicts_b.len(),
        1,
        "exactly one side loses"
    );

    // After one more catch-up cycle both snapshots agree with the server
    till_a.trigger().await.unwrap();
    till_b.trigger().await.unwrap();
    let row_a = store_a.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    let row_b = store_b.get(ResourceKind::Product, "p1").await.unwrap().unwrap();
    assert_eq!(row_a, row_b);
    assert_eq!(row_a.version, 2);
}

#[tokio::test]
async fn failure_retry_failed_gives_conflict_a_second_chance() {
    let coordinator = memory_coordinator();
    let device = scope("till-1");

    coordinator
        .push_events(
            &device,
            vec![ClientEvent {
                idempotency_token: "tok-1".to_string(),
                event_type: "update".to_string(),
                resource_type: "product".to_string(),
                resource_id: "p1".to_string(),
                payload: json!({"sku": "p1", "name": "N", "price_cents": 100, "expected_version": 1}),
            }],
            None,
        )
        .await
        .unwrap();

    // not_found conflict: the product does not exist yet
    assert_eq!(coordinator.status("t1").await.unwrap().conflict_count, 1);

    // The product appears...
    coordinator
        .push_events(
            &device,
            vec![ClientEvent {
                idempotency_token: "tok-2".to_string(),
                event_type: "create".to_string(),
                resource_type: "product".to_string(),
                resource_id: "p1".to_string(),
                payload: json!({"sku": "p1", "name": "N", "price_cents": 100}),
            }],
            None,
        )
        .await
        .unwrap();

    // ...and the retried update now applies
    let retried = coordinator.retry_failed("t1").await.unwrap();
    assert_eq!(retried.retried_count, 1);
    let status = coordinator.status("t1").await.unwrap();
    assert_eq!(status.conflict_count, 0);

    let record = coordinator
        .resources()
        .get("t1", ResourceKind::Product, "p1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 2);
}

/// Transport that counts pushes and fails until told otherwise.
struct FlakyTransport {
    inner: InProcessTransport,
    pushes: AtomicUsize,
    fail: watch::Receiver<bool>,
}

#[async_trait]
impl SyncTransport for FlakyTransport {
    async fn push_events(
        &self,
        scope: &EventScope,
        events: Vec<ClientEvent>,
        after_id: Option<i64>,
    ) -> Result<PushResponse, TransportError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if *self.fail.borrow() {
            return Err(TransportError::Unavailable("simulated outage".to_string()));
        }
        self.inner.push_events(scope, events, after_id).await
    }

    async fn events_since(
        &self,
        tenant_id: &str,
        after_id: i64,
    ) -> Result<Vec<SyncEvent>, TransportError> {
        if *self.fail.borrow() {
            return Err(TransportError::Unavailable("simulated outage".to_string()));
        }
        self.inner.events_since(tenant_id, after_id).await
    }
}

#[tokio::test]
async fn failure_outage_preserves_batch_and_tokens() {
    let coordinator = memory_coordinator();
    let (fail_tx, fail_rx) = watch::channel(true);
    let transport = Arc::new(FlakyTransport {
        inner: InProcessTransport::new(coordinator.clone()),
        pushes: AtomicUsize::new(0),
        fail: fail_rx,
    });

    let store = Arc::new(MemoryLocalStore::new());
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = SyncWorker::new(
        store.clone(),
        transport.clone(),
        scope("till-1"),
        SyncConfig::default(),
        online_rx,
    );

    let queued = store.enqueue(create_product("p1", "Espresso")).await.unwrap();

    // Three cycles against a dead server: item untouched every time
    for _ in 0..3 {
        assert_eq!(worker.trigger().await.unwrap(), CycleOutcome::TransportFailed);
    }
    let batch = store.peek_batch(10).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].retry_count, 0);
    assert_eq!(batch[0].idempotency_token, queued.idempotency_token);
    assert_eq!(transport.pushes.load(Ordering::SeqCst), 3);

    // Outage ends: same token finally lands, exactly once
    fail_tx.send(false).unwrap();
    let outcome = worker.trigger().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Completed { settled: 1, merged: 1 });
    let record = coordinator
        .resources()
        .get("t1", ResourceKind::Product, "p1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 1);
}

#[tokio::test]
async fn failure_dead_letter_requeue_round_trip() {
    let coordinator = memory_coordinator();
    let (worker, store, _online) = worker_with(coordinator, "till-1");

    // Permanently invalid: update with no expected_version. Validation
    // rejects never improve with resubmission, so one cycle dead-letters it
    store
        .enqueue(NewQueueItem {
            event_type: EventType::Update,
            resource_kind: ResourceKind::Product,
            resource_id: "p1".to_string(),
            payload: json!({"sku": "p1", "name": "N", "price_cents": 100}),
        })
        .await
        .unwrap();

    worker.trigger().await.unwrap();
    assert_eq!(store.queue_depth().await.unwrap(), 0);
    let dead = store.dead_items(10).await.unwrap();
    assert_eq!(dead.len(), 1);

    // Operator requeues it; it goes back into the next batch
    store.requeue(dead[0].local_id).await.unwrap();
    assert_eq!(store.queue_depth().await.unwrap(), 1);
    let batch = store.peek_batch(10).await.unwrap();
    assert_eq!(batch[0].retry_count, 0);

    // Still invalid, so the next cycle dead-letters it again
    worker.trigger().await.unwrap();
    assert_eq!(store.dead_items(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failure_validation_rejects_are_never_logged() {
    let coordinator = memory_coordinator();
    let response = coordinator
        .push_events(
            &scope("till-1"),
            vec![
                ClientEvent {
                    idempotency_token: "tok-good".to_string(),
                    event_type: "create".to_string(),
                    resource_type: "product".to_string(),
                    resource_id: "p1".to_string(),
                    payload: json!({"sku": "p1", "name": "N", "price_cents": 100}),
                },
                ClientEvent {
                    idempotency_token: "tok-bad".to_string(),
                    event_type: "create".to_string(),
                    resource_type: "gift_card".to_string(),
                    resource_id: "g1".to_string(),
                    payload: json!({}),
                },
            ],
            None,
        )
        .await
        .unwrap();

    // The good event lands, the bad one bounces without a log entry
    assert_eq!(response.synced_count, 1);
    assert_eq!(response.errors.len(), 1);
    let status = coordinator.status("t1").await.unwrap();
    assert_eq!(status.pending_count + status.conflict_count, 0);
}
