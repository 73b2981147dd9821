use futures::future::join_all;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CacheKey, CacheRow, CacheStore, Tier};
use crate::context::RequestId;

/// Escritura pendiente.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert { tier: Tier, rows: Vec<CacheRow> },
    Update { key: CacheKey },
}

#[derive(Debug, Default)]
struct PendingWriteSet {
    insert: Vec<(Tier, Vec<CacheRow>)>,
    update: Vec<CacheKey>,
}

impl PendingWriteSet {
    fn push(&mut self, op: WriteOp) {
        match op {
            WriteOp::Insert { tier, rows } => {
                if !rows.is_empty() {
                    self.insert.push((tier, rows));
                }
            }
            WriteOp::Update { key } => self.update.push(key),
        }
    }
}

/// Resultado de un flush: cuántas escrituras se ejecutaron y cuántas fallaron.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub executed: usize,
    pub failed: usize,
}

/// Cola de escrituras diferidas, agrupadas por request id.
///
/// All cache writes go through here. A single mutex covers both appends and
/// the read-modify-flush of the pending map, so a request's writes run at
/// most once even when several completion paths race to flush it. Write
/// failures are logged and swallowed: losing a cache write only costs a
/// future miss.
pub struct DeferredWriteQueue {
    store: Arc<dyn CacheStore>,
    pending: Mutex<HashMap<RequestId, PendingWriteSet>>,
}

impl DeferredWriteQueue {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn append(&self, request_id: RequestId, op: WriteOp) {
        let mut pending = self.pending.lock().await;
        pending.entry(request_id).or_default().push(op);
    }

    /// Ejecuta las escrituras de una petición. Sin entradas es un no-op.
    pub async fn flush(&self, request_id: RequestId) -> FlushReport {
        let mut pending = self.pending.lock().await;
        let Some(set) = pending.remove(&request_id) else {
            return FlushReport::default();
        };

        debug!("Ejecutando escrituras de cache para la petición {}", request_id);
        let report = self.execute(set.insert, set.update).await;
        if report.failed > 0 {
            warn!(
                "⚠️ {} de {} escrituras de cache fallaron para la petición {}",
                report.failed,
                report.executed + report.failed,
                request_id
            );
        } else {
            debug!("Escrituras completadas para la petición {}", request_id);
        }
        report
    }

    /// Drains every pending request. Inserts are merged into one bulk write
    /// per tier; updates run individually. All writes run concurrently.
    pub async fn flush_all(&self) -> FlushReport {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return FlushReport::default();
        }

        debug!("Ejecutando {} conjuntos de escrituras pendientes", pending.len());
        let mut inserts: HashMap<Tier, Vec<CacheRow>> = HashMap::new();
        let mut updates = Vec::new();
        for (_, set) in pending.drain() {
            for (tier, rows) in set.insert {
                inserts.entry(tier).or_default().extend(rows);
            }
            updates.extend(set.update);
        }

        let report = self.execute(inserts.into_iter().collect(), updates).await;
        if report.failed > 0 {
            warn!("⚠️ {} escrituras pendientes fallaron", report.failed);
        } else {
            debug!("Escrituras pendientes completadas ({})", report.executed);
        }
        report
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn execute(&self, inserts: Vec<(Tier, Vec<CacheRow>)>, updates: Vec<CacheKey>) -> FlushReport {
        let store = &self.store;
        let insert_writes = inserts.into_iter().map(|(tier, rows)| async move {
            store.insert(tier, rows).await.map_err(|e| (tier, e))
        });
        let update_writes = updates.into_iter().map(|key| async move {
            let tier = key.tier;
            store.update(&key, None).await.map_err(|e| (tier, e))
        });

        let (inserted, updated) = futures::join!(join_all(insert_writes), join_all(update_writes));

        let mut report = FlushReport::default();
        for result in inserted.into_iter().chain(updated) {
            match result {
                Ok(()) => report.executed += 1,
                Err((tier, e)) => {
                    debug!("Escritura en tabla {} fallida: {}", tier, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePayload, MemoryCacheStore, MockCacheStore};
    use crate::error::AudioError;
    use pretty_assertions::assert_eq;

    fn youtube_row(key: &str) -> CacheRow {
        CacheRow::new(key, CachePayload::YouTube(format!("https://youtu.be/{key}")))
    }

    #[tokio::test]
    async fn test_flush_runs_staged_writes_once() {
        let mut mock = MockCacheStore::new();
        mock.expect_insert().times(1).returning(|_, _| Ok(()));
        mock.expect_update().times(1).returning(|_, _| Ok(()));
        let queue = DeferredWriteQueue::new(Arc::new(mock));

        let id = RequestId(1);
        queue
            .append(id, WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("a")] })
            .await;
        queue.append(id, WriteOp::Update { key: CacheKey::youtube("b") }).await;

        assert_eq!(queue.flush(id).await, FlushReport { executed: 2, failed: 0 });
        assert_eq!(queue.flush(id).await, FlushReport::default());
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_flush_unknown_request_is_noop() {
        let mut mock = MockCacheStore::new();
        mock.expect_insert().times(0);
        mock.expect_update().times(0);
        let queue = DeferredWriteQueue::new(Arc::new(mock));
        assert_eq!(queue.flush(RequestId(42)).await, FlushReport::default());
    }

    #[tokio::test]
    async fn test_flush_only_touches_its_request() {
        let store = Arc::new(MemoryCacheStore::new());
        let queue = DeferredWriteQueue::new(store.clone());

        queue
            .append(RequestId(1), WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("a")] })
            .await;
        queue
            .append(RequestId(2), WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("b")] })
            .await;

        queue.flush(RequestId(1)).await;
        assert_eq!(store.len(Tier::YouTube), 1);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_flush_all_merges_inserts_per_tier_and_clears() {
        let mut mock = MockCacheStore::new();
        mock.expect_insert()
            .withf(|tier, rows| *tier == Tier::YouTube && rows.len() == 3)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_insert()
            .withf(|tier, rows| *tier == Tier::Spotify && rows.is_empty())
            .times(0);
        mock.expect_update().times(2).returning(|_, _| Ok(()));
        let queue = DeferredWriteQueue::new(Arc::new(mock));

        queue
            .append(RequestId(1), WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("a")] })
            .await;
        queue
            .append(
                RequestId(2),
                WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("b"), youtube_row("c")] },
            )
            .await;
        queue
            .append(RequestId(2), WriteOp::Insert { tier: Tier::Spotify, rows: Vec::new() })
            .await;
        queue.append(RequestId(3), WriteOp::Update { key: CacheKey::lavalink("q1") }).await;
        queue.append(RequestId(1), WriteOp::Update { key: CacheKey::lavalink("q2") }).await;

        let report = queue.flush_all().await;
        assert_eq!(report, FlushReport { executed: 3, failed: 0 });
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_writes_are_isolated_and_swallowed() {
        let mut mock = MockCacheStore::new();
        mock.expect_insert()
            .withf(|tier, _| *tier == Tier::Lavalink)
            .returning(|_, _| Err(AudioError::StorageUnavailable("disk full".into())));
        mock.expect_insert()
            .withf(|tier, _| *tier == Tier::YouTube)
            .times(1)
            .returning(|_, _| Ok(()));
        let queue = DeferredWriteQueue::new(Arc::new(mock));

        queue
            .append(
                RequestId(7),
                WriteOp::Insert {
                    tier: Tier::Lavalink,
                    rows: vec![CacheRow::new("q", CachePayload::Lavalink("{}".into()))],
                },
            )
            .await;
        queue
            .append(RequestId(7), WriteOp::Insert { tier: Tier::YouTube, rows: vec![youtube_row("a")] })
            .await;

        assert_eq!(queue.flush(RequestId(7)).await, FlushReport { executed: 1, failed: 1 });
        assert_eq!(queue.pending_len().await, 0);
    }
}
