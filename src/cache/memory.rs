use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{now_timestamp, CacheEntry, CacheKey, CachePayload, CacheRow, CacheStore, Tier};
use crate::error::AudioError;

/// Cache en memoria, una tabla `DashMap` por tier.
///
/// Contents can be snapshotted to a JSON file and restored on startup so a
/// restart does not throw away every resolved query.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    lavalink: Arc<DashMap<String, CacheEntry>>,
    youtube: Arc<DashMap<String, CacheEntry>>,
    spotify: Arc<DashMap<String, CacheEntry>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    tables: BTreeMap<Tier, BTreeMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, tier: Tier) -> &DashMap<String, CacheEntry> {
        match tier {
            Tier::Lavalink => &self.lavalink,
            Tier::YouTube => &self.youtube,
            Tier::Spotify => &self.spotify,
        }
    }

    pub fn len(&self, tier: Tier) -> usize {
        self.table(tier).len()
    }

    pub fn is_empty(&self) -> bool {
        Tier::ALL.iter().all(|t| self.table(*t).is_empty())
    }

    /// Carga un snapshot previo; un archivo inexistente deja la cache vacía.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize, AudioError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Sin snapshot de cache en {}", path.display());
                return Ok(0);
            }
            Err(e) => return Err(AudioError::StorageUnavailable(e.to_string())),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| AudioError::StorageUnavailable(format!("corrupt snapshot: {e}")))?;

        let mut loaded = 0;
        for (tier, rows) in snapshot.tables {
            let table = self.table(tier);
            for (key, entry) in rows {
                if entry.payload.tier() != tier {
                    warn!("Entrada de cache en tabla incorrecta ignorada: {} / {}", tier, key);
                    continue;
                }
                table.insert(key, entry);
                loaded += 1;
            }
        }

        info!("📂 Cache restaurada: {} entradas desde {}", loaded, path.display());
        Ok(loaded)
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, AudioError> {
        let mut snapshot = Snapshot::default();
        let mut saved = 0;
        for tier in Tier::ALL {
            let rows: BTreeMap<String, CacheEntry> = self
                .table(tier)
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            saved += rows.len();
            snapshot.tables.insert(tier, rows);
        }

        let content = serde_json::to_string(&snapshot)
            .map_err(|e| AudioError::StorageUnavailable(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AudioError::StorageUnavailable(e.to_string()))?;
        }
        fs::write(path, content)
            .await
            .map_err(|e| AudioError::StorageUnavailable(e.to_string()))?;

        info!("💾 Cache guardada: {} entradas en {}", saved, path.display());
        Ok(saved)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn fetch_one(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AudioError> {
        Ok(self.table(key.tier).get(&key.key).map(|e| e.value().clone()))
    }

    async fn insert(&self, tier: Tier, rows: Vec<CacheRow>) -> Result<(), AudioError> {
        let table = self.table(tier);
        for row in rows {
            if row.tier() != tier {
                warn!("Fila de {} descartada al insertar en {}", row.tier(), tier);
                continue;
            }
            table.insert(
                row.key,
                CacheEntry {
                    payload: row.payload,
                    last_updated: row.last_updated,
                    last_fetched: row.last_fetched,
                },
            );
        }
        Ok(())
    }

    async fn update(&self, key: &CacheKey, payload: Option<CachePayload>) -> Result<(), AudioError> {
        let now = now_timestamp();
        if let Some(mut entry) = self.table(key.tier).get_mut(&key.key) {
            entry.last_fetched = now;
            if let Some(payload) = payload {
                if payload.tier() == key.tier {
                    entry.payload = payload;
                    entry.last_updated = now;
                }
            }
        }
        Ok(())
    }

    async fn fetch_random(&self, tier: Tier, not_older_than: i64) -> Result<Option<CacheEntry>, AudioError> {
        let mut rng = rand::thread_rng();
        Ok(self
            .table(tier)
            .iter()
            .filter(|e| e.value().is_fresh(not_older_than))
            .map(|e| e.value().clone())
            .choose(&mut rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_insert_then_fetch_returns_same_payload() {
        let store = MemoryCacheStore::new();
        let before = now_timestamp();
        let row = CacheRow::new("daft punk one more time", CachePayload::YouTube("https://youtu.be/abc".into()));

        store.insert(Tier::YouTube, vec![row]).await.unwrap();
        let entry = store
            .fetch_one(&CacheKey::youtube("daft punk one more time"))
            .await
            .unwrap()
            .expect("entry present");

        assert_eq!(entry.payload, CachePayload::YouTube("https://youtu.be/abc".into()));
        assert!(entry.last_updated >= before);
    }

    #[tokio::test]
    async fn test_tiers_are_separate_tables() {
        let store = MemoryCacheStore::new();
        store
            .insert(Tier::YouTube, vec![CacheRow::new("k", CachePayload::YouTube("u".into()))])
            .await
            .unwrap();

        assert!(store.fetch_one(&CacheKey::lavalink("k")).await.unwrap().is_none());
        assert_eq!(store.len(Tier::YouTube), 1);
        assert_eq!(store.len(Tier::Lavalink), 0);
    }

    #[tokio::test]
    async fn test_mismatched_rows_are_not_inserted() {
        let store = MemoryCacheStore::new();
        store
            .insert(Tier::Lavalink, vec![CacheRow::new("k", CachePayload::YouTube("u".into()))])
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_refreshes_fetch_time_only() {
        let store = MemoryCacheStore::new();
        let mut row = CacheRow::new("q", CachePayload::Lavalink("{}".into()));
        row.last_updated = 10;
        row.last_fetched = 10;
        store.insert(Tier::Lavalink, vec![row]).await.unwrap();

        store.update(&CacheKey::lavalink("q"), None).await.unwrap();
        let entry = store.fetch_one(&CacheKey::lavalink("q")).await.unwrap().unwrap();
        assert_eq!(entry.last_updated, 10);
        assert!(entry.last_fetched > 10);

        store
            .update(&CacheKey::lavalink("q"), Some(CachePayload::Lavalink("[]".into())))
            .await
            .unwrap();
        let entry = store.fetch_one(&CacheKey::lavalink("q")).await.unwrap().unwrap();
        assert_eq!(entry.payload, CachePayload::Lavalink("[]".into()));
        assert!(entry.last_updated > 10);
    }

    #[tokio::test]
    async fn test_fetch_random_skips_stale_entries() {
        let store = MemoryCacheStore::new();
        let mut stale = CacheRow::new("old", CachePayload::Lavalink("{}".into()));
        stale.last_updated = 5;
        store.insert(Tier::Lavalink, vec![stale]).await.unwrap();

        assert!(store.fetch_random(Tier::Lavalink, 6).await.unwrap().is_none());
        assert!(store.fetch_random(Tier::Lavalink, 5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("snapshot.json");

        let store = MemoryCacheStore::new();
        store
            .insert(Tier::YouTube, vec![CacheRow::new("a", CachePayload::YouTube("u1".into()))])
            .await
            .unwrap();
        assert_eq!(store.save_snapshot(&path).await.unwrap(), 1);

        let restored = MemoryCacheStore::new();
        assert_eq!(restored.load_snapshot(&path).await.unwrap(), 1);
        let entry = restored.fetch_one(&CacheKey::youtube("a")).await.unwrap().unwrap();
        assert_eq!(entry.payload, CachePayload::YouTube("u1".into()));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryCacheStore::new();
        assert_eq!(store.load_snapshot(&dir.path().join("none.json")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let err = MemoryCacheStore::new().load_snapshot(&path).await.unwrap_err();
        assert!(matches!(err, AudioError::StorageUnavailable(_)));
    }
}
