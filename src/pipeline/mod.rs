//! # Resolution Pipeline
//!
//! Turns one user query into playable tracks by walking the
//! Spotify → YouTube → Lavalink cascade, cache-first at every tier.
//!
//! ```text
//! spotify:playlist:<id> ──► Spotify API (paginated) ──► "<track> <artist>"
//!                                                          │
//!                              YouTube tier / Data API ◄───┘
//!                                                          │ watch URL
//!                              Lavalink tier / node    ◄───┘
//!                                                          │
//!                                                   ResolvedTrack
//! ```
//!
//! Cache reads go straight to the [`CacheStore`]. New entries are
//! accumulated while the resolution runs and staged on the
//! [`DeferredWriteQueue`] as one insert per tier when it ends; hits stage a
//! freshness update instead. Nothing here writes to the store directly.

pub mod autoplay;
pub mod notifier;
pub mod query;
mod spotify;

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::audio::enqueue::TrackFilter;
use crate::audio::node::AudioNode;
use crate::audio::track::{LoadResult, ResolvedTrack};
use crate::cache::{
    now_timestamp, CacheEntry, CacheKey, CacheLevel, CachePayload, CacheRow, CacheStore,
    DeferredWriteQueue, SpotifyTrackRecord, Tier, WriteOp,
};
use crate::context::{RequestContext, RequestId};
use crate::error::AudioError;
use crate::sources::{SpotifyApi, SpotifyKind, YouTubeApi};

pub use notifier::{ChannelNotifier, Phase, Progress, ProgressNotifier, SilentNotifier};
pub use query::Query;

/// Playlist de respaldo para autoplay cuando el cache no aporta nada.
pub const DEFAULT_AUTOPLAY_PLAYLIST: &str =
    "https://www.youtube.com/playlist?list=PL4fGSI1pDJn5rWitrRWFKdm-ulaFiIyoK";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Entries last updated longer ago than this are misses.
    pub cache_age: Duration,
    pub consecutive_failure_limit: usize,
    pub autoplay_playlist: String,
    pub autoplay_attempts: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache_age: Duration::from_secs(365 * 24 * 60 * 60),
            consecutive_failure_limit: 10,
            autoplay_playlist: DEFAULT_AUTOPLAY_PLAYLIST.to_string(),
            autoplay_attempts: 10,
        }
    }
}

/// Resultado de una resolución.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Allowed tracks, in source order.
    pub tracks: Vec<ResolvedTrack>,
    pub succeeded: usize,
    pub failed: usize,
    /// Resolved but rejected by the guild filter.
    pub filtered: usize,
    /// Stopped early at the consecutive-failure ceiling.
    pub aborted: bool,
    pub playlist_name: Option<String>,
}

impl Resolution {
    fn accept(&mut self, track: ResolvedTrack, filter: &TrackFilter) {
        self.succeeded += 1;
        if filter(&track) {
            self.tracks.push(track);
        } else {
            self.filtered += 1;
        }
    }
}

/// Filas nuevas acumuladas durante una resolución, por tier.
///
/// Also carries the cache level read when the resolution started.
struct StagedRows {
    level: CacheLevel,
    rows: HashMap<Tier, Vec<CacheRow>>,
}

impl StagedRows {
    fn new(level: CacheLevel) -> Self {
        Self {
            level,
            rows: HashMap::new(),
        }
    }

    fn push(&mut self, row: CacheRow) {
        let tier = row.tier();
        if self.level.is_enabled(tier) {
            self.rows.entry(tier).or_default().push(row);
        }
    }

    async fn stage(self, writes: &DeferredWriteQueue, request_id: RequestId) {
        for (tier, rows) in self.rows {
            if !rows.is_empty() {
                debug!("Preparando {} filas nuevas para la tabla {}", rows.len(), tier);
                writes.append(request_id, WriteOp::Insert { tier, rows }).await;
            }
        }
    }
}

pub struct ResolutionPipeline {
    store: Arc<dyn CacheStore>,
    writes: Arc<DeferredWriteQueue>,
    spotify: Arc<dyn SpotifyApi>,
    youtube: Arc<dyn YouTubeApi>,
    node: Arc<dyn AudioNode>,
    cache_level: RwLock<CacheLevel>,
    settings: PipelineSettings,
}

impl ResolutionPipeline {
    pub fn new(
        store: Arc<dyn CacheStore>,
        writes: Arc<DeferredWriteQueue>,
        spotify: Arc<dyn SpotifyApi>,
        youtube: Arc<dyn YouTubeApi>,
        node: Arc<dyn AudioNode>,
        cache_level: CacheLevel,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            writes,
            spotify,
            youtube,
            node,
            cache_level: RwLock::new(cache_level),
            settings,
        }
    }

    pub fn cache_level(&self) -> CacheLevel {
        *self.cache_level.read()
    }

    /// Takes effect from the next resolution on.
    pub fn set_cache_level(&self, level: CacheLevel) {
        *self.cache_level.write() = level;
        info!("🗄️ Nivel de cache actualizado: {:?}", level.enabled_tiers());
    }

    /// Resuelve una consulta completa a tracks reproducibles.
    ///
    /// Returns [`AudioError::NoResults`] only when nothing usable came back
    /// and nothing was filtered out; a resolution that hit the failure
    /// ceiling returns whatever it had, even if that is nothing.
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        input: &str,
        notifier: &dyn ProgressNotifier,
        filter: &TrackFilter,
    ) -> Result<Resolution, AudioError> {
        let query = Query::parse(input)?;
        let mut staged = StagedRows::new(self.cache_level());

        let result = match &query {
            Query::Spotify {
                kind: SpotifyKind::Track,
                id,
            } => self.resolve_spotify_track(ctx, id, filter, &mut staged).await,
            Query::Spotify { kind, id } => {
                self.resolve_spotify_collection(ctx, *kind, id, notifier, filter, &mut staged)
                    .await
            }
            _ => self.resolve_direct(ctx, &query, filter, &mut staged).await,
        };
        staged.stage(&self.writes, ctx.request_id).await;

        let resolution = result?;
        if resolution.tracks.is_empty() && resolution.filtered == 0 && !resolution.aborted {
            return Err(AudioError::NoResults(input.to_string()));
        }

        info!(
            "🎶 '{}' resuelto: {} tracks ({} fallidos, {} filtrados)",
            input,
            resolution.tracks.len(),
            resolution.failed,
            resolution.filtered
        );
        Ok(resolution)
    }

    /// Lavalink-tier lookup for one query, cache-first.
    pub async fn fetch_track(&self, ctx: &RequestContext, input: &str) -> Result<LoadResult, AudioError> {
        let query = Query::parse(input)?;
        let mut staged = StagedRows::new(self.cache_level());
        let result = self.lookup_lavalink(ctx, &query, &mut staged).await;
        staged.stage(&self.writes, ctx.request_id).await;
        result
    }

    /// YouTube-tier lookup for a `"<track> <artist>"` descriptor, cache-first.
    pub async fn youtube_query(&self, ctx: &RequestContext, descriptor: &str) -> Result<Option<String>, AudioError> {
        let mut staged = StagedRows::new(self.cache_level());
        let result = self.lookup_youtube(ctx, descriptor, &mut staged).await;
        staged.stage(&self.writes, ctx.request_id).await;
        result
    }

    async fn resolve_direct(
        &self,
        ctx: &RequestContext,
        query: &Query,
        filter: &TrackFilter,
        staged: &mut StagedRows,
    ) -> Result<Resolution, AudioError> {
        let result = self.lookup_lavalink(ctx, query, staged).await?;
        if let Some(message) = &result.error_message {
            warn!("Lavalink no pudo cargar '{}': {}", query.lavalink_identifier(), message);
            return Err(AudioError::NoResults(query.lavalink_identifier()));
        }

        let mut resolution = Resolution {
            playlist_name: result.playlist_name.clone(),
            ..Default::default()
        };
        for track in result.playable() {
            resolution.accept(track, filter);
        }
        Ok(resolution)
    }

    async fn resolve_spotify_track(
        &self,
        ctx: &RequestContext,
        id: &str,
        filter: &TrackFilter,
        staged: &mut StagedRows,
    ) -> Result<Resolution, AudioError> {
        let record = self.lookup_spotify_track(ctx, id, staged).await?;
        let mut resolution = Resolution::default();
        match self.resolve_member(ctx, &record, staged).await? {
            Some(track) => resolution.accept(track, filter),
            None => return Err(AudioError::NoResults(record.track_info)),
        }
        Ok(resolution)
    }

    /// YouTube then Lavalink for one Spotify track. `Ok(None)` means the
    /// member could not be resolved and counts as a failure.
    async fn resolve_member(
        &self,
        ctx: &RequestContext,
        record: &SpotifyTrackRecord,
        staged: &mut StagedRows,
    ) -> Result<Option<ResolvedTrack>, AudioError> {
        let Some(url) = self.lookup_youtube(ctx, &record.track_info, staged).await? else {
            debug!("Sin video de YouTube para '{}'", record.track_info);
            return Ok(None);
        };

        let result = self.lookup_lavalink(ctx, &Query::Url(url), staged).await?;
        if result.has_error() {
            return Ok(None);
        }
        Ok(result.playable().into_iter().next())
    }

    fn cutoff(&self) -> i64 {
        now_timestamp() - self.settings.cache_age.as_secs() as i64
    }

    /// Fresh entry for `key`, or `None` when the tier is disabled, the entry
    /// is missing or stale, or the store failed.
    async fn cached(&self, level: CacheLevel, key: &CacheKey) -> Option<CacheEntry> {
        if !level.is_enabled(key.tier) {
            return None;
        }
        match self.store.fetch_one(key).await {
            Ok(Some(entry)) if entry.is_fresh(self.cutoff()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!("⚠️ Lectura de cache {} fallida, se trata como miss: {}", key.tier, e);
                None
            }
        }
    }

    async fn touch(&self, ctx: &RequestContext, key: CacheKey) {
        self.writes.append(ctx.request_id, WriteOp::Update { key }).await;
    }

    async fn lookup_lavalink(
        &self,
        ctx: &RequestContext,
        query: &Query,
        staged: &mut StagedRows,
    ) -> Result<LoadResult, AudioError> {
        let identifier = query.lavalink_identifier();
        let key = CacheKey::lavalink(identifier.clone());

        if !query.is_local() {
            if let Some(CacheEntry {
                payload: CachePayload::Lavalink(raw),
                ..
            }) = self.cached(staged.level, &key).await
            {
                match serde_json::from_str::<LoadResult>(&raw) {
                    Ok(result) if !result.has_error() => {
                        debug!("Cache hit en lavalink para '{}'", identifier);
                        self.touch(ctx, key).await;
                        return Ok(result);
                    }
                    Ok(_) => debug!("Entrada con error en cache para '{}', se vuelve a cargar", identifier),
                    Err(e) => warn!("Entrada de cache ilegible para '{}': {}", identifier, e),
                }
            }
        }

        let result = self.node.load_tracks(&identifier).await?;
        if !result.has_error() && !query.is_local() && !result.tracks.is_empty() {
            match serde_json::to_string(&result) {
                Ok(raw) => staged.push(CacheRow::new(identifier, CachePayload::Lavalink(raw))),
                Err(e) => warn!("No se pudo serializar el resultado de '{}': {}", identifier, e),
            }
        }
        Ok(result)
    }

    async fn lookup_youtube(
        &self,
        ctx: &RequestContext,
        descriptor: &str,
        staged: &mut StagedRows,
    ) -> Result<Option<String>, AudioError> {
        let key = CacheKey::youtube(descriptor);
        if let Some(CacheEntry {
            payload: CachePayload::YouTube(url),
            ..
        }) = self.cached(staged.level, &key).await
        {
            self.touch(ctx, key).await;
            return Ok(Some(url));
        }

        let url = self.youtube.get_call(descriptor).await?;
        if let Some(url) = &url {
            staged.push(CacheRow::new(descriptor, CachePayload::YouTube(url.clone())));
        }
        Ok(url)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::audio::node::MockAudioNode;
    use crate::audio::track::{sample_track, LoadType};
    use crate::cache::MemoryCacheStore;
    use crate::sources::{MockSpotifyApi, MockYouTubeApi};

    pub fn allow_all() -> TrackFilter {
        Arc::new(|_| true)
    }

    pub fn single(title: &str) -> LoadResult {
        LoadResult {
            load_type: LoadType::Track,
            playlist_name: None,
            tracks: vec![sample_track(title, 180)],
            error_message: None,
        }
    }

    pub struct Harness {
        pub store: MemoryCacheStore,
        pub writes: Arc<DeferredWriteQueue>,
        pub pipeline: ResolutionPipeline,
    }

    pub fn harness(
        spotify: MockSpotifyApi,
        youtube: MockYouTubeApi,
        node: MockAudioNode,
        level: CacheLevel,
    ) -> Harness {
        let store = MemoryCacheStore::new();
        let writes = Arc::new(DeferredWriteQueue::new(Arc::new(store.clone())));
        let pipeline = ResolutionPipeline::new(
            Arc::new(store.clone()),
            writes.clone(),
            Arc::new(spotify),
            Arc::new(youtube),
            Arc::new(node),
            level,
            PipelineSettings::default(),
        );
        Harness {
            store,
            writes,
            pipeline,
        }
    }
}
