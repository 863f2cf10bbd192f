//! Persistent key-value storage used by the background context.
//!
//! [`KvStore`] is the narrow host interface (get/set/remove/clear over JSON values keyed by
//! string). [`Storage`] layers typed accessors and the migration runner on top of it.

pub mod file;
#[cfg(test)]
pub mod memory;
pub mod migrations;

pub use file::FileStore;
#[cfg(test)]
pub use memory::MemoryStore;

use eyre::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::{future::Future, sync::Arc};

/// Host key-value store. Missing keys are simply absent from `get` results.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, keys: &[&str]) -> impl Future<Output = eyre::Result<Map<String, Value>>> + Send;

    fn set(&self, record: Map<String, Value>) -> impl Future<Output = eyre::Result<()>> + Send;

    fn remove(&self, keys: &[&str]) -> impl Future<Output = eyre::Result<()>> + Send;

    fn clear(&self) -> impl Future<Output = eyre::Result<()>> + Send;
}

/// Typed accessors over a shared [`KvStore`].
#[derive(Debug)]
pub struct Storage<S> {
    store: Arc<S>,
}

impl<S> Clone for Storage<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KvStore> Storage<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub async fn fetch<T: DeserializeOwned>(&self, key: &str) -> eyre::Result<Option<T>> {
        let mut items = self.store.get(&[key]).await?;
        items
            .remove(key)
            .map(|v| serde_json::from_value(v).with_context(|| format!("decode storage key {key}")))
            .transpose()
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> eyre::Result<()> {
        let v = serde_json::to_value(value).with_context(|| format!("encode storage key {key}"))?;
        let mut record = Map::new();
        record.insert(key.to_owned(), v);
        self.store.set(record).await
    }

    /// Write several keys in one store call.
    pub async fn put_record(&self, record: Map<String, Value>) -> eyre::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        self.store.set(record).await
    }

    pub async fn remove(&self, key: &str) -> eyre::Result<()> {
        self.store.remove(&[key]).await
    }

    /// Raw values for `keys`, as stored.
    pub async fn snapshot(&self, keys: &[&str]) -> eyre::Result<Map<String, Value>> {
        self.store.get(keys).await
    }

    pub async fn clear(&self) -> eyre::Result<()> {
        self.store.clear().await
    }
}
