//! End-to-end walkthrough: two tills sharing one store, an offline sale,
//! and a conflicting price update.
//!
//! Run with: `cargo run --example basic_usage`

use std::sync::Arc;

use pos_sync::client::{OutboxStore, SnapshotStore};
use pos_sync::event::{EventScope, EventType};
use pos_sync::payload::ResourceKind;
use pos_sync::{
    InMemoryEventLog, InMemoryResources, InProcessTransport, MemoryLocalStore, NewQueueItem,
    SyncConfig, SyncCoordinator, SyncWorker,
};
use serde_json::json;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryResources::new()),
        SyncConfig::default(),
    ));

    let (till_a, store_a, online_a) = till(&coordinator, "till-a");
    let (till_b, store_b, _online_b) = till(&coordinator, "till-b");

    // Till A creates a product and syncs it up
    store_a
        .enqueue(NewQueueItem {
            event_type: EventType::Create,
            resource_kind: ResourceKind::Product,
            resource_id: "espresso".into(),
            payload: json!({"sku": "ESP-1", "name": "Espresso", "price_cents": 350}),
        })
        .await
        .unwrap();
    till_a.trigger().await.unwrap();

    // Till B catches up and sees it
    till_b.trigger().await.unwrap();
    let row = store_b
        .get(ResourceKind::Product, "espresso")
        .await
        .unwrap()
        .expect("till B should have the product");
    println!("till B sees {} at version {}", row.data["name"], row.version);

    // Till A goes offline and records a sale; nothing leaves the device
    online_a.send(false).unwrap();
    store_a
        .enqueue(NewQueueItem {
            event_type: EventType::Create,
            resource_kind: ResourceKind::Sale,
            resource_id: "sale-1".into(),
            payload: json!({
                "location_id": "shop-1",
                "lines": [{"product_id": "espresso", "quantity": 2, "unit_price_cents": 350}],
                "total_cents": 700,
            }),
        })
        .await
        .unwrap();
    println!(
        "till A offline, queued mutations: {}",
        store_a.queue_depth().await.unwrap()
    );

    // Meanwhile till B re-prices the product (version 1 -> 2)
    store_b
        .enqueue(NewQueueItem {
            event_type: EventType::Update,
            resource_kind: ResourceKind::Product,
            resource_id: "espresso".into(),
            payload: json!({
                "sku": "ESP-1", "name": "Espresso", "price_cents": 400,
                "expected_version": 1,
            }),
        })
        .await
        .unwrap();
    till_b.trigger().await.unwrap();

    // Till A also re-prices against the version it last saw, then reconnects
    store_a
        .enqueue(NewQueueItem {
            event_type: EventType::Update,
            resource_kind: ResourceKind::Product,
            resource_id: "espresso".into(),
            payload: json!({
                "sku": "ESP-1", "name": "Espresso", "price_cents": 375,
                "expected_version": 1,
            }),
        })
        .await
        .unwrap();
    online_a.send(true).unwrap();
    till_a.trigger().await.unwrap();

    // The sale went through; the stale re-price surfaced as a conflict
    for conflict in till_a.drain_conflicts() {
        println!(
            "till A conflict on {} '{}': {} (server at version {})",
            conflict.resource_type,
            conflict.resource_id,
            conflict.kind,
            conflict.current["version"],
        );
    }
    let row = store_a
        .get(ResourceKind::Product, "espresso")
        .await
        .unwrap()
        .unwrap();
    println!(
        "till A converged on price {} at version {}",
        row.data["price_cents"], row.version
    );

    let status = coordinator.status("tenant-1").await.unwrap();
    println!(
        "server status: {} pending, {} failed",
        status.pending_count, status.conflict_count
    );
}

fn till(
    coordinator: &Arc<SyncCoordinator>,
    device_id: &str,
) -> (SyncWorker, Arc<MemoryLocalStore>, watch::Sender<bool>) {
    let store = Arc::new(MemoryLocalStore::new());
    let (online_tx, online_rx) = watch::channel(true);
    let worker = SyncWorker::new(
        store.clone(),
        Arc::new(InProcessTransport::new(coordinator.clone())),
        EventScope::new("tenant-1", "cashier-1", device_id),
        SyncConfig::default(),
        online_rx,
    );
    (worker, store, online_tx)
}
