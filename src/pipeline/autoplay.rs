use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use super::{Query, ResolutionPipeline, StagedRows};
use crate::audio::enqueue::TrackFilter;
use crate::audio::track::{LoadResult, ResolvedTrack};
use crate::cache::{CacheEntry, CacheLevel, CachePayload, Tier};
use crate::context::RequestContext;
use crate::error::AudioError;

impl ResolutionPipeline {
    /// Elige un track para seguir sonando cuando la cola se vacía.
    ///
    /// Sources are tried in order: the guild's own playlist when it has one,
    /// a random fresh Lavalink cache entry when that tier is enabled, then
    /// the fallback playlist. Streams and tracks rejected by `filter` are
    /// skipped; the pick is marked with `extras.autoplay = true`.
    pub async fn autoplay(
        &self,
        ctx: &RequestContext,
        filter: &TrackFilter,
        guild_playlist: Option<&str>,
    ) -> Result<ResolvedTrack, AudioError> {
        let level = self.cache_level();

        if let Some(url) = guild_playlist {
            match self.load_playlist(ctx, url, level).await {
                Ok(tracks) => {
                    if let Some(track) = self.pick(ctx, tracks, filter) {
                        return Ok(track);
                    }
                    debug!("Playlist de autoplay del guild {} sin tracks válidos", ctx.guild_id);
                }
                Err(e) => warn!("⚠️ Playlist de autoplay del guild {} no disponible: {}", ctx.guild_id, e),
            }
        }

        if level.is_enabled(Tier::Lavalink) {
            if let Some(track) = self.pick(ctx, self.random_cached_tracks().await, filter) {
                return Ok(track);
            }
        }

        let fallback = self.settings.autoplay_playlist.clone();
        let tracks = self.load_playlist(ctx, &fallback, level).await?;
        self.pick(ctx, tracks, filter)
            .ok_or_else(|| AudioError::NoResults("autoplay".into()))
    }

    async fn random_cached_tracks(&self) -> Vec<ResolvedTrack> {
        match self.store.fetch_random(Tier::Lavalink, self.cutoff()).await {
            Ok(Some(CacheEntry {
                payload: CachePayload::Lavalink(raw),
                ..
            })) => match serde_json::from_str::<LoadResult>(&raw) {
                Ok(result) if !result.has_error() => result.tracks,
                Ok(_) => {
                    debug!("Entrada aleatoria con error, se usa la playlist de respaldo");
                    Vec::new()
                }
                Err(e) => {
                    warn!("Entrada de cache ilegible para autoplay: {}", e);
                    Vec::new()
                }
            },
            Ok(_) => {
                debug!("Cache de lavalink vacío para autoplay");
                Vec::new()
            }
            Err(e) => {
                warn!("⚠️ Cache no disponible para autoplay: {}", e);
                Vec::new()
            }
        }
    }

    async fn load_playlist(
        &self,
        ctx: &RequestContext,
        url: &str,
        level: CacheLevel,
    ) -> Result<Vec<ResolvedTrack>, AudioError> {
        let mut staged = StagedRows::new(level);
        let result = self.lookup_lavalink(ctx, &Query::Url(url.to_string()), &mut staged).await;
        staged.stage(&self.writes, ctx.request_id).await;
        Ok(result?.tracks)
    }

    /// Hasta `autoplay_attempts` candidatos al azar; el primero válido gana.
    fn pick(&self, ctx: &RequestContext, mut candidates: Vec<ResolvedTrack>, filter: &TrackFilter) -> Option<ResolvedTrack> {
        candidates.shuffle(&mut rand::thread_rng());
        let mut track = candidates
            .into_iter()
            .take(self.settings.autoplay_attempts)
            .find(|t| !t.is_stream && filter(t))?;

        track.mark_autoplay();
        info!("🔁 Autoplay en guild {}: {}", ctx.guild_id, track.title);
        Some(track)
    }
}
