use super::KvStore;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

/// In-process store with no persistence. Used as the storage fake in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Map<String, Value>>,
}

impl KvStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> eyre::Result<Map<String, Value>> {
        let items = self.items.lock().await;
        Ok(keys
            .iter()
            .filter_map(|k| items.get(*k).map(|v| ((*k).to_owned(), v.clone())))
            .collect())
    }

    async fn set(&self, record: Map<String, Value>) -> eyre::Result<()> {
        self.items.lock().await.extend(record);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> eyre::Result<()> {
        let mut items = self.items.lock().await;
        for k in keys {
            items.remove(*k);
        }
        Ok(())
    }

    async fn clear(&self) -> eyre::Result<()> {
        self.items.lock().await.clear();
        Ok(())
    }
}
