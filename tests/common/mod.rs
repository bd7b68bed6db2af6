//! Common helpers for the cross-context tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tabsync::{
    Config, DatabaseSchema, DbEventData, DbSelfDelivery, Event, EventHandler, Origin,
};
use tokio::sync::mpsc;

pub const HEARTBEAT_MS: u64 = 20;
pub const LIVENESS_MS: u64 = 100;

/// An origin with fast election timing, storing its files under `dir`.
pub fn origin(dir: &tempfile::TempDir, policy: DbSelfDelivery) -> Origin {
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        heartbeat_interval_ms: HEARTBEAT_MS,
        liveness_timeout_ms: LIVENESS_MS,
        db_self_delivery: policy,
        ..Config::default()
    };
    let schema = DatabaseSchema::new("shared", 1)
        .table("users", "id,name")
        .expect("users schema");
    Origin::new(config, schema).expect("origin")
}

pub fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| {
        let _ = tx.send(event.clone());
    });
    (handler, rx)
}

pub async fn next_db(rx: &mut mpsc::UnboundedReceiver<Event>) -> DbEventData {
    let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("event arrives in time")
        .expect("sender alive");
    event.db_data().expect("db payload")
}

/// Waits long enough for any in-flight message to land, then drains.
pub async fn quiet(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    tokio::time::sleep(Duration::from_millis(150)).await;
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
