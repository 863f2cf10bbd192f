use super::{KvStore, Storage};
use chrono::{DateTime, Utc};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::info;

/// Storage key holding the append-only list of [`AppliedMigration`] records.
pub const MIGRATIONS_KEY: &str = "migrations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub name: String,
    pub date_applied: DateTime<Utc>,
}

/// A named, synchronous data transformation over a context `C`.
pub struct Migration<C: ?Sized> {
    pub name: &'static str,
    pub up: fn(&mut C) -> eyre::Result<()>,
}

impl<C: ?Sized> std::fmt::Debug for Migration<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("name", &self.name).finish()
    }
}

/// Run, in list order, every migration whose name is not in `applied`.
///
/// Returns the records for the migrations run by this call; persisting them is the
/// caller's job. The first failing `up` aborts the batch and its error is returned as-is
/// (with context), so migrations that already ran in this batch are not reported.
pub fn migrate<C: ?Sized>(
    migrations: &[Migration<C>],
    applied: &[AppliedMigration],
    ctx: &mut C,
) -> eyre::Result<Vec<AppliedMigration>> {
    let mut seen: HashSet<&str> = applied.iter().map(|m| m.name.as_str()).collect();
    let mut fresh = Vec::new();

    for m in migrations {
        if !seen.insert(m.name) {
            continue;
        }
        (m.up)(ctx).with_context(|| format!("migration {} failed", m.name))?;
        info!(migration = m.name, "applied storage migration");
        fresh.push(AppliedMigration {
            name: m.name.to_owned(),
            date_applied: Utc::now(),
        });
    }

    Ok(fresh)
}

impl<S: KvStore> Storage<S> {
    /// Run `migrations` over the stored values of `keys` and persist the outcome.
    ///
    /// Migrations see a map holding whichever of `keys` currently exist. Entries they add
    /// or change are written back; entries they remove are deleted from the store. The
    /// newly applied records are appended under [`MIGRATIONS_KEY`] in the same write.
    pub async fn run_migrations(
        &self,
        keys: &[&str],
        migrations: &[Migration<Map<String, Value>>],
    ) -> eyre::Result<Vec<AppliedMigration>> {
        let mut applied: Vec<AppliedMigration> =
            self.fetch(MIGRATIONS_KEY).await?.unwrap_or_default();
        let before = self.snapshot(keys).await?;
        let mut data = before.clone();

        let fresh = migrate(migrations, &applied, &mut data)?;
        if fresh.is_empty() {
            return Ok(fresh);
        }

        let dropped: Vec<&String> = before
            .keys()
            .filter(|k| !data.contains_key(k.as_str()))
            .collect();
        let mut record: Map<String, Value> = data
            .iter()
            .filter(|(k, v)| before.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        applied.extend(fresh.iter().cloned());
        record.insert(
            MIGRATIONS_KEY.to_owned(),
            serde_json::to_value(&applied).context("encode migration records")?,
        );

        // New values land before old keys go, so a failed write leaves the old data intact
        // and the batch unrecorded.
        self.put_record(record).await?;
        for k in dropped {
            self.remove(k).await?;
        }

        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn bump(n: &mut u32) -> eyre::Result<()> {
        *n += 1;
        Ok(())
    }

    fn fail(_n: &mut u32) -> eyre::Result<()> {
        eyre::bail!("cannot upgrade")
    }

    #[test]
    fn runs_pending_migration_once() -> eyre::Result<()> {
        let mut calls = 0_u32;
        let out = migrate(&[Migration { name: "a", up: bump }], &[], &mut calls)?;
        assert_eq!(calls, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out.first().map(|m| m.name.as_str()), Some("a"));
        Ok(())
    }

    #[test]
    fn skips_already_applied() -> eyre::Result<()> {
        let mut calls = 0_u32;
        let applied = [AppliedMigration {
            name: "a".into(),
            date_applied: Utc::now(),
        }];
        let out = migrate(&[Migration { name: "a", up: bump }], &applied, &mut calls)?;
        assert_eq!(calls, 0);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn failure_aborts_the_rest_of_the_batch() {
        let mut calls = 0_u32;
        let res = migrate(
            &[
                Migration { name: "a", up: bump },
                Migration { name: "b", up: fail },
                Migration { name: "c", up: bump },
            ],
            &[],
            &mut calls,
        );
        let err = res.err().map(|e| format!("{e:#}")).unwrap_or_default();
        assert!(err.contains("migration b failed"), "got: {err}");
        assert!(err.contains("cannot upgrade"), "got: {err}");
        assert_eq!(calls, 1);
    }

    #[test]
    fn duplicate_names_run_once() -> eyre::Result<()> {
        let mut calls = 0_u32;
        let out = migrate(
            &[Migration { name: "a", up: bump }, Migration { name: "a", up: bump }],
            &[],
            &mut calls,
        )?;
        assert_eq!(calls, 1);
        assert_eq!(out.len(), 1);
        Ok(())
    }

    fn rename_legacy(data: &mut Map<String, Value>) -> eyre::Result<()> {
        if let Some(v) = data.remove("old") {
            data.insert("new".into(), v);
        }
        Ok(())
    }

    #[tokio::test]
    async fn stored_migrations_persist_changes_and_records() -> eyre::Result<()> {
        let storage = Storage::new(MemoryStore::default());
        storage.put("old", &json!([1, 2])).await?;

        let migrations = [Migration {
            name: "rename_legacy",
            up: rename_legacy,
        }];
        let first = storage.run_migrations(&["old", "new"], &migrations).await?;
        assert_eq!(first.len(), 1);
        assert_eq!(storage.fetch::<Value>("old").await?, None);
        assert_eq!(storage.fetch::<Value>("new").await?, Some(json!([1, 2])));

        let records: Vec<AppliedMigration> =
            storage.fetch(MIGRATIONS_KEY).await?.unwrap_or_default();
        assert_eq!(records.len(), 1);

        let second = storage.run_migrations(&["old", "new"], &migrations).await?;
        assert!(second.is_empty());
        Ok(())
    }

    /// Reads and removes work; every `set` fails.
    #[derive(Debug, Default)]
    struct ReadOnlyAfterSeed {
        inner: MemoryStore,
    }

    impl KvStore for ReadOnlyAfterSeed {
        async fn get(&self, keys: &[&str]) -> eyre::Result<Map<String, Value>> {
            self.inner.get(keys).await
        }

        async fn set(&self, _record: Map<String, Value>) -> eyre::Result<()> {
            eyre::bail!("disk full")
        }

        async fn remove(&self, keys: &[&str]) -> eyre::Result<()> {
            self.inner.remove(keys).await
        }

        async fn clear(&self) -> eyre::Result<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_pre_migration_data() -> eyre::Result<()> {
        let store = ReadOnlyAfterSeed::default();
        let mut seed = Map::new();
        seed.insert("old".into(), json!([1, 2]));
        store.inner.set(seed).await?;
        let storage = Storage::new(store);

        let migrations = [Migration {
            name: "rename_legacy",
            up: rename_legacy,
        }];
        let res = storage.run_migrations(&["old", "new"], &migrations).await;
        assert!(res.is_err());
        assert_eq!(storage.fetch::<Value>("old").await?, Some(json!([1, 2])));
        assert_eq!(storage.fetch::<Value>(MIGRATIONS_KEY).await?, None);
        Ok(())
    }
}
