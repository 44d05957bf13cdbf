use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use conclave_core::error::Result;
use conclave_core::traits::ThreadStore;

/// In-process thread checkpoints. Snapshots are opaque JSON; durable
/// storage belongs to whoever embeds the engine.
#[derive(Default)]
pub struct InMemoryThreadStore {
    snapshots: Mutex<HashMap<String, serde_json::Value>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn save(&self, thread_id: &str, snapshot: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let thread_id = thread_id.to_string();
        Box::pin(async move {
            if let Ok(mut snapshots) = self.snapshots.lock() {
                snapshots.insert(thread_id, snapshot);
            }
            Ok(())
        })
    }

    fn load(&self, thread_id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let thread_id = thread_id.to_string();
        Box::pin(async move {
            Ok(self
                .snapshots
                .lock()
                .ok()
                .and_then(|snapshots| snapshots.get(&thread_id).cloned()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryThreadStore::new();
        store
            .save("t-1", serde_json::json!({"round": 2}))
            .await
            .unwrap();

        let snapshot = store.load("t-1").await.unwrap().unwrap();
        assert_eq!(snapshot["round"], 2);
        assert!(store.load("t-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_existing_snapshot() {
        let store = InMemoryThreadStore::new();
        store.save("t", serde_json::json!({"v": 1})).await.unwrap();
        store.save("t", serde_json::json!({"v": 2})).await.unwrap();

        let snapshot = store.load("t").await.unwrap().unwrap();
        assert_eq!(snapshot["v"], 2);
    }
}
