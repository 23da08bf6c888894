//! Ordered lifecycle event bus.
//!
//! Each event is appended to SQLite (which assigns its `seq`) and then broadcast to
//! live subscribers. Appends and broadcasts happen under one lock, so subscribers see
//! events in `seq` order.

use std::sync::Arc;

use familiar_core::events::EventPayload;
use familiar_core::Event;
use tokio::sync::broadcast;
use tracing::{error, trace};

use crate::storage::{Result, Storage};

/// Live-subscriber buffer. Slow subscribers that fall further behind resync from storage.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct EventBus {
    storage: Arc<Storage>,
    tx: broadcast::Sender<Event>,
    write_lock: tokio::sync::Mutex<()>,
}

impl EventBus {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_capacity(storage, DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(storage: Arc<Storage>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            storage,
            tx,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Persist and broadcast an event.
    pub async fn publish(&self, payload: EventPayload) -> Result<Event> {
        let _guard = self.write_lock.lock().await;
        let event = self.storage.append_event(&payload).await?;
        trace!(seq = event.seq, event_type = %event.event_type, "event published");
        // No receivers is fine.
        let _ = self.tx.send(event.clone());
        Ok(event)
    }

    /// Publish, logging instead of failing. Event delivery never fails a workflow.
    pub async fn emit(&self, payload: EventPayload) {
        let event_type = payload.event_type();
        if let Err(e) = self.publish(payload).await {
            error!(event_type = event_type.as_str(), error = %e, "failed to record event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Persisted events with `seq > after`, oldest first.
    pub async fn history(&self, after: i64, limit: i64) -> Result<Vec<Event>> {
        self.storage.list_events_after(after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use familiar_core::events::WorkflowStartedPayload;
    use tempfile::TempDir;

    fn started(task_id: &str) -> EventPayload {
        EventPayload::WorkflowStarted(WorkflowStartedPayload {
            task_id: task_id.to_string(),
            grimoire: "default".to_string(),
        })
    }

    async fn bus() -> (EventBus, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("events.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (EventBus::new(Arc::new(storage)), dir)
    }

    #[tokio::test]
    async fn subscribers_see_persisted_events_in_order() {
        let (bus, _dir) = bus().await;
        let mut rx = bus.subscribe();

        let a = bus.publish(started("A")).await.unwrap();
        let b = bus.publish(started("B")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().seq, a.seq);
        assert_eq!(rx.recv().await.unwrap().seq, b.seq);

        let history = bus.history(a.seq, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn concurrent_publishers_broadcast_in_seq_order() {
        let (bus, _dir) = bus().await;
        let bus = Arc::new(bus);
        let mut rx = bus.subscribe();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move { bus.emit(started(&format!("T{i}"))).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..20 {
            let event = rx.recv().await.unwrap();
            assert!(event.seq > last);
            last = event.seq;
        }
    }
}
