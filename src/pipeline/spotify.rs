use tracing::{debug, info, warn};

use super::{Phase, Progress, ProgressNotifier, Resolution, ResolutionPipeline, StagedRows};
use crate::audio::enqueue::TrackFilter;
use crate::cache::{CacheEntry, CacheKey, CachePayload, CacheRow, SpotifyTrackRecord};
use crate::context::RequestContext;
use crate::error::AudioError;
use crate::sources::spotify::{page_parts, track_record};
use crate::sources::SpotifyKind;

impl ResolutionPipeline {
    /// Raw track items of a Spotify resource, following `next` links in
    /// order. A failing later page ends pagination with what was collected.
    pub async fn spotify_fetch_tracks(
        &self,
        kind: SpotifyKind,
        id: &str,
        notifier: &dyn ProgressNotifier,
    ) -> Result<Vec<serde_json::Value>, AudioError> {
        let first = self.spotify.get_call(&kind.api_url(id)).await?;
        if !kind.is_collection() {
            return Ok(vec![first]);
        }

        let (mut items, mut next, total) = page_parts(&first);
        self.report(notifier, items.len(), total.unwrap_or(items.len()), Phase::Spotify)
            .await;

        while let Some(url) = next.take() {
            match self.spotify.get_call(&url).await {
                Ok(page) => {
                    let (page_items, page_next, _) = page_parts(&page);
                    items.extend(page_items);
                    next = page_next;
                    self.report(notifier, items.len(), total.unwrap_or(items.len()), Phase::Spotify)
                        .await;
                }
                Err(e) => {
                    warn!("⚠️ Paginación de Spotify interrumpida tras {} items: {}", items.len(), e);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }

        debug!("Spotify {} {}: {} items", kind, id, items.len());
        Ok(items)
    }

    /// Turns a Spotify link into YouTube URLs, or into raw `"<track> <artist>"`
    /// descriptors when `skip_youtube` is set. Never touches the Lavalink tier.
    ///
    /// Reports `youtube`-phase progress on every second descriptor and on the
    /// last one.
    pub async fn spotify_query(
        &self,
        ctx: &RequestContext,
        kind: SpotifyKind,
        id: &str,
        skip_youtube: bool,
        notifier: &dyn ProgressNotifier,
    ) -> Result<Vec<String>, AudioError> {
        let mut staged = StagedRows::new(self.cache_level());
        let result = self
            .spotify_query_inner(ctx, kind, id, skip_youtube, notifier, &mut staged)
            .await;
        staged.stage(&self.writes, ctx.request_id).await;

        let found = result?;
        if found.is_empty() {
            return Err(AudioError::NoResults(format!("spotify:{kind}:{id}")));
        }
        Ok(found)
    }

    async fn spotify_query_inner(
        &self,
        ctx: &RequestContext,
        kind: SpotifyKind,
        id: &str,
        skip_youtube: bool,
        notifier: &dyn ProgressNotifier,
        staged: &mut StagedRows,
    ) -> Result<Vec<String>, AudioError> {
        let descriptors: Vec<String> = if kind.is_collection() {
            let items = self.spotify_fetch_tracks(kind, id, notifier).await?;
            items
                .iter()
                .filter_map(track_record)
                .map(|record| {
                    let descriptor = record.track_info.clone();
                    staged.push(CacheRow::new(record.uri.clone(), CachePayload::Spotify(record)));
                    descriptor
                })
                .collect()
        } else {
            vec![self.lookup_spotify_track(ctx, id, staged).await?.track_info]
        };

        if skip_youtube {
            return Ok(descriptors);
        }

        let total = descriptors.len();
        let mut urls = Vec::with_capacity(total);
        for (index, descriptor) in descriptors.iter().enumerate() {
            match self.lookup_youtube(ctx, descriptor, staged).await {
                Ok(Some(url)) => urls.push(url),
                Ok(None) => debug!("Sin video de YouTube para '{}'", descriptor),
                Err(e) if e.is_fatal_for_resolution() || !kind.is_collection() => return Err(e),
                Err(e) => debug!("Búsqueda de '{}' fallida: {}", descriptor, e),
            }
            let current = index + 1;
            if current % 2 == 0 || current == total {
                self.report(notifier, current, total, Phase::YouTube).await;
            }
            tokio::task::yield_now().await;
        }
        Ok(urls)
    }

    pub(super) async fn lookup_spotify_track(
        &self,
        ctx: &RequestContext,
        id: &str,
        staged: &mut StagedRows,
    ) -> Result<SpotifyTrackRecord, AudioError> {
        let uri = format!("spotify:track:{id}");
        let key = CacheKey::spotify(uri.clone());
        if let Some(CacheEntry {
            payload: CachePayload::Spotify(record),
            ..
        }) = self.cached(staged.level, &key).await
        {
            self.touch(ctx, key).await;
            return Ok(record);
        }

        let body = self.spotify.get_call(&SpotifyKind::Track.api_url(id)).await?;
        let record = track_record(&body)
            .ok_or_else(|| AudioError::UpstreamFormat(format!("unexpected Spotify track payload for {uri}")))?;
        staged.push(CacheRow::new(uri, CachePayload::Spotify(record.clone())));
        Ok(record)
    }

    pub(super) async fn resolve_spotify_collection(
        &self,
        ctx: &RequestContext,
        kind: SpotifyKind,
        id: &str,
        notifier: &dyn ProgressNotifier,
        filter: &TrackFilter,
        staged: &mut StagedRows,
    ) -> Result<Resolution, AudioError> {
        let items = self.spotify_fetch_tracks(kind, id, notifier).await?;
        let records: Vec<SpotifyTrackRecord> = items.iter().filter_map(track_record).collect();
        let total = records.len();
        info!("📋 Resolviendo {} {} con {} canciones", kind, id, total);

        let limit = self.settings.consecutive_failure_limit;
        let mut resolution = Resolution::default();
        let mut consecutive_failures = 0;

        for (index, record) in records.into_iter().enumerate() {
            let current = index + 1;
            staged.push(CacheRow::new(record.uri.clone(), CachePayload::Spotify(record.clone())));

            let resolved = match self.resolve_member(ctx, &record, staged).await {
                Ok(track) => track,
                Err(e) if e.is_fatal_for_resolution() => return Err(e),
                Err(e) => {
                    debug!("Falló '{}': {}", record.track_info, e);
                    None
                }
            };

            match resolved {
                Some(track) => {
                    consecutive_failures = 0;
                    resolution.accept(track, filter);
                }
                None => {
                    resolution.failed += 1;
                    consecutive_failures += 1;
                    if consecutive_failures >= limit {
                        warn!(
                            "⚠️ {} fallos consecutivos en {} {}, se detiene con {} tracks",
                            consecutive_failures,
                            kind,
                            id,
                            resolution.tracks.len()
                        );
                        resolution.aborted = true;
                        self.report(notifier, current, total, Phase::Lavalink).await;
                        break;
                    }
                }
            }

            if current % 2 == 0 || current == total {
                self.report(notifier, current, total, Phase::Lavalink).await;
            }
            tokio::task::yield_now().await;
        }

        Ok(resolution)
    }

    async fn report(&self, notifier: &dyn ProgressNotifier, current: usize, total: usize, phase: Phase) {
        let progress = Progress { current, total, phase };
        if let Err(e) = notifier.notify(progress).await {
            debug!("Notificación de progreso descartada: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{ChannelNotifier, SilentNotifier};
    use std::time::Duration;
    use crate::audio::node::MockAudioNode;
    use crate::cache::{CacheLevel, Tier};
    use crate::context::RequestContext;
    use crate::error::AudioError;
    use crate::pipeline::notifier::{MockProgressNotifier, Phase, Progress};
    use crate::sources::{MockSpotifyApi, MockYouTubeApi, SpotifyKind};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn ctx() -> RequestContext {
        RequestContext::new(42, 1, 2)
    }

    fn item(name: &str) -> Value {
        json!({
            "track": {
                "id": name,
                "name": name,
                "type": "track",
                "uri": format!("spotify:track:{name}"),
                "artists": [{"name": "Band"}]
            }
        })
    }

    fn page(names: &[&str], next: Option<&str>) -> Value {
        let items: Vec<Value> = names.iter().map(|n| item(n)).collect();
        json!({"items": items, "next": next, "total": 3})
    }

    fn watch_url(descriptor: &str) -> String {
        let title = descriptor.trim_end_matches(" Band");
        format!("https://www.youtube.com/watch?v={title}")
    }

    /// Node that answers a watch URL with a track titled after its video id.
    fn echo_node() -> MockAudioNode {
        let mut node = MockAudioNode::new();
        node.expect_load_tracks().returning(|identifier| {
            let title = identifier.rsplit('=').next().unwrap_or_default().to_string();
            Ok(single(&title))
        });
        node
    }

    fn titles(tracks: &[crate::audio::track::ResolvedTrack]) -> Vec<String> {
        tracks.iter().map(|t| t.title.clone()).collect()
    }

    #[tokio::test]
    async fn test_member_failure_is_skipped_in_order() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Ok(page(&["a", "b", "c"], None)));
        let mut youtube = MockYouTubeApi::new();
        youtube.expect_get_call().returning(|descriptor| {
            if descriptor.starts_with("b ") {
                Ok(None)
            } else {
                Ok(Some(watch_url(descriptor)))
            }
        });
        let mut notifier = MockProgressNotifier::new();
        notifier
            .expect_notify()
            .returning(|_| Err(anyhow::anyhow!("channel deleted")));

        let h = harness(spotify, youtube, echo_node(), CacheLevel::all());
        let resolution = h
            .pipeline
            .resolve(&ctx(), "spotify:album:xyz", &notifier, &allow_all())
            .await
            .unwrap();

        assert_eq!(titles(&resolution.tracks), vec!["a", "c"]);
        assert_eq!(resolution.succeeded, 2);
        assert_eq!(resolution.failed, 1);
        assert!(!resolution.aborted);
    }

    #[tokio::test]
    async fn test_consecutive_failures_stop_at_limit() {
        let names: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let mut spotify = MockSpotifyApi::new();
        spotify.expect_get_call().returning(move |_| {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            Ok(page(&refs, None))
        });
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .times(10)
            .returning(|_| Err(AudioError::UpstreamTransient("timeout".into())));

        let h = harness(spotify, youtube, MockAudioNode::new(), CacheLevel::all());
        let resolution = h
            .pipeline
            .resolve(&ctx(), "spotify:playlist:xyz", &SilentNotifier, &allow_all())
            .await
            .unwrap();

        assert!(resolution.aborted);
        assert_eq!(resolution.failed, 10);
        assert!(resolution.tracks.is_empty());
    }

    #[tokio::test]
    async fn test_failure_streak_keeps_tracks_resolved_before_it() {
        let mut names = vec!["ok1".to_string(), "ok2".to_string()];
        names.extend((0..11).map(|i| format!("f{i}")));
        names.push("ok3".to_string());
        let mut spotify = MockSpotifyApi::new();
        spotify.expect_get_call().returning(move |_| {
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            Ok(page(&refs, None))
        });
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .withf(|d| d.starts_with("ok"))
            .times(2)
            .returning(|d| Ok(Some(watch_url(d))));
        // f10 y ok3 nunca se consultan
        youtube
            .expect_get_call()
            .withf(|d| d.starts_with('f'))
            .times(10)
            .returning(|_| Err(AudioError::UpstreamTransient("timeout".into())));

        let (tx, mut rx) = mpsc::channel(32);
        let h = harness(spotify, youtube, echo_node(), CacheLevel::all());
        let resolution = h
            .pipeline
            .resolve(&ctx(), "spotify:playlist:xyz", &ChannelNotifier::new(tx), &allow_all())
            .await
            .unwrap();

        assert!(resolution.aborted);
        assert_eq!(titles(&resolution.tracks), vec!["ok1", "ok2"]);
        assert_eq!(resolution.failed, 10);

        let mut last = None;
        while let Ok(progress) = rx.try_recv() {
            last = Some(progress);
        }
        assert_eq!(
            last,
            Some(Progress {
                current: 12,
                total: 14,
                phase: Phase::Lavalink
            })
        );
    }

    #[tokio::test]
    async fn test_unread_progress_channel_does_not_stall() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Ok(page(&["a", "b", "c", "d"], None)));
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .returning(|descriptor| Ok(Some(watch_url(descriptor))));

        let (tx, _rx) = mpsc::channel(1);
        let notifier = ChannelNotifier::new(tx);
        let h = harness(spotify, youtube, echo_node(), CacheLevel::all());
        let resolution = tokio::time::timeout(
            Duration::from_secs(3),
            h.pipeline
                .resolve(&ctx(), "spotify:playlist:xyz", &notifier, &allow_all()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(titles(&resolution.tracks), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_spotify_query_reports_youtube_progress() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Ok(page(&["a", "b", "c"], None)));
        let mut youtube = MockYouTubeApi::new();
        youtube.expect_get_call().returning(|d| Ok(Some(watch_url(d))));

        let (tx, mut rx) = mpsc::channel(16);
        let h = harness(spotify, youtube, MockAudioNode::new(), CacheLevel::all());
        let urls = h
            .pipeline
            .spotify_query(&ctx(), SpotifyKind::Album, "xyz", false, &ChannelNotifier::new(tx))
            .await
            .unwrap();
        assert_eq!(urls.len(), 3);

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress);
        }
        let progress = |current, phase| Progress { current, total: 3, phase };
        assert_eq!(
            seen,
            vec![
                progress(3, Phase::Spotify),
                progress(2, Phase::YouTube),
                progress(3, Phase::YouTube),
            ]
        );
    }

    #[tokio::test]
    async fn test_pagination_preserves_order_and_reports_progress() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .withf(|url| url.ends_with("/playlists/xyz/tracks?limit=100"))
            .returning(|_| Ok(page(&["a", "b"], Some("https://api.spotify.com/v1/page2"))));
        spotify
            .expect_get_call()
            .withf(|url| url == "https://api.spotify.com/v1/page2")
            .returning(|_| Ok(page(&["c"], None)));
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .returning(|descriptor| Ok(Some(watch_url(descriptor))));

        let (tx, mut rx) = mpsc::channel(16);
        let h = harness(spotify, youtube, echo_node(), CacheLevel::all());
        let resolution = h
            .pipeline
            .resolve(&ctx(), "https://open.spotify.com/playlist/xyz", &ChannelNotifier::new(tx), &allow_all())
            .await
            .unwrap();
        assert_eq!(titles(&resolution.tracks), vec!["a", "b", "c"]);

        let mut seen = Vec::new();
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress);
        }
        let progress = |current, phase| Progress { current, total: 3, phase };
        assert_eq!(
            seen,
            vec![
                progress(2, Phase::Spotify),
                progress(3, Phase::Spotify),
                progress(2, Phase::Lavalink),
                progress(3, Phase::Lavalink),
            ]
        );

        // una inserción por tier
        h.writes.flush(ctx().request_id).await;
        assert_eq!(h.store.len(Tier::Spotify), 3);
        assert_eq!(h.store.len(Tier::YouTube), 3);
        assert_eq!(h.store.len(Tier::Lavalink), 3);
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_collected_items() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .withf(|url| url.contains("/albums/"))
            .returning(|_| Ok(page(&["a"], Some("https://api.spotify.com/v1/page2"))));
        spotify
            .expect_get_call()
            .withf(|url| url.ends_with("page2"))
            .returning(|_| Err(AudioError::UpstreamTransient("503".into())));

        let h = harness(spotify, MockYouTubeApi::new(), MockAudioNode::new(), CacheLevel::all());
        let found = h
            .pipeline
            .spotify_query(&ctx(), SpotifyKind::Album, "xyz", true, &SilentNotifier)
            .await
            .unwrap();
        assert_eq!(found, vec!["a Band".to_string()]);
    }

    #[tokio::test]
    async fn test_unauthorized_surfaces_auth_error() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Err(AudioError::UpstreamAuth("HTTP 401".into())));

        let h = harness(spotify, MockYouTubeApi::new(), MockAudioNode::new(), CacheLevel::all());
        let err = h
            .pipeline
            .resolve(&ctx(), "spotify:playlist:xyz", &SilentNotifier, &allow_all())
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::UpstreamAuth(_)));
    }

    #[tokio::test]
    async fn test_single_track_uses_every_tier_and_caches() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .times(1)
            .returning(|_| Ok(item("solo")["track"].clone()));
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .withf(|d| d == "solo Band")
            .times(1)
            .returning(|d| Ok(Some(watch_url(d))));
        let mut node = MockAudioNode::new();
        node.expect_load_tracks()
            .times(1)
            .returning(|_| Ok(single("solo")));

        let h = harness(spotify, youtube, node, CacheLevel::all());
        for _ in 0..2 {
            let resolution = h
                .pipeline
                .resolve(&ctx(), "spotify:track:solo", &SilentNotifier, &allow_all())
                .await
                .unwrap();
            assert_eq!(titles(&resolution.tracks), vec!["solo"]);
            h.writes.flush(ctx().request_id).await;
        }
    }

    #[tokio::test]
    async fn test_spotify_query_returns_youtube_urls() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Ok(item("solo")["track"].clone()));
        let mut youtube = MockYouTubeApi::new();
        youtube.expect_get_call().returning(|d| Ok(Some(watch_url(d))));

        let h = harness(spotify, youtube, MockAudioNode::new(), CacheLevel::none());
        let urls = h
            .pipeline
            .spotify_query(&ctx(), SpotifyKind::Track, "solo", false, &SilentNotifier)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://www.youtube.com/watch?v=solo".to_string()]);
        assert_eq!(h.writes.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_youtube_failure_on_single_track_is_surfaced() {
        let mut spotify = MockSpotifyApi::new();
        spotify
            .expect_get_call()
            .returning(|_| Ok(item("solo")["track"].clone()));
        let mut youtube = MockYouTubeApi::new();
        youtube
            .expect_get_call()
            .returning(|_| Err(AudioError::UpstreamTransient("timeout".into())));

        let h = harness(spotify, youtube, MockAudioNode::new(), CacheLevel::all());
        let err = h
            .pipeline
            .resolve(&ctx(), "spotify:track:solo", &SilentNotifier, &allow_all())
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::UpstreamTransient(_)));
    }
}
