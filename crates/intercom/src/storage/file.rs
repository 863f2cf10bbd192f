use super::KvStore;
use eyre::Context as _;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Store backed by a single JSON object file.
///
/// The whole object is kept in memory and rewritten atomically on every mutation. Only one
/// process may own the file at a time; the daemon's single-instance lock provides that.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: Mutex<Map<String, Value>>,
}

impl FileStore {
    pub fn open(path: &Path) -> eyre::Result<Self> {
        let items = match crate::fsutil::read_private(path)? {
            Some(bytes) => match serde_json::from_slice::<Value>(&bytes)
                .with_context(|| format!("parse storage file {}", path.display()))?
            {
                Value::Object(m) => m,
                Value::Null
                | Value::Bool(_)
                | Value::Number(_)
                | Value::String(_)
                | Value::Array(_) => {
                    eyre::bail!("storage file {} is not a JSON object", path.display())
                }
            },
            None => Map::new(),
        };
        debug!(path = %path.display(), keys = items.len(), "opened storage file");
        Ok(Self {
            path: path.to_path_buf(),
            items: Mutex::new(items),
        })
    }

    fn persist(&self, items: &Map<String, Value>) -> eyre::Result<()> {
        let bytes = serde_json::to_vec_pretty(items).context("serialize storage")?;
        crate::fsutil::write_atomic_private(&self.path, &bytes)
            .with_context(|| format!("write storage file {}", self.path.display()))
    }
}

impl KvStore for FileStore {
    async fn get(&self, keys: &[&str]) -> eyre::Result<Map<String, Value>> {
        let items = self.items.lock().await;
        Ok(keys
            .iter()
            .filter_map(|k| items.get(*k).map(|v| ((*k).to_owned(), v.clone())))
            .collect())
    }

    async fn set(&self, record: Map<String, Value>) -> eyre::Result<()> {
        let mut items = self.items.lock().await;
        let mut next = items.clone();
        next.extend(record);
        self.persist(&next)?;
        *items = next;
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> eyre::Result<()> {
        let mut items = self.items.lock().await;
        if !keys.iter().any(|k| items.contains_key(*k)) {
            return Ok(());
        }
        let mut next = items.clone();
        for k in keys {
            next.remove(*k);
        }
        self.persist(&next)?;
        *items = next;
        Ok(())
    }

    async fn clear(&self) -> eyre::Result<()> {
        let mut items = self.items.lock().await;
        self.persist(&Map::new())?;
        items.clear();
        Ok(())
    }
}
