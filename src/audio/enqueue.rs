use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::node::AudioNode;
use super::player::{GuildPlayer, QueueItem};
use super::track::ResolvedTrack;
use crate::context::RequestContext;
use crate::error::AudioError;

/// Predicado de lista de permitidos.
pub type TrackFilter = Arc<dyn Fn(&ResolvedTrack) -> bool + Send + Sync>;

/// White/black lists of a guild, matched case-insensitively against
/// `"title author uri"`. A non-empty whitelist wins over the blacklist.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl AllowList {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        let lower = |words: &[String]| -> Vec<String> { words.iter().map(|w| w.to_lowercase()).collect() };
        Self {
            whitelist: lower(whitelist),
            blacklist: lower(blacklist),
        }
    }

    pub fn is_allowed(&self, track: &ResolvedTrack) -> bool {
        let text = track.filter_text().to_lowercase();
        if !self.whitelist.is_empty() {
            return self.whitelist.iter().any(|w| text.contains(w.as_str()));
        }
        !self.blacklist.iter().any(|w| text.contains(w.as_str()))
    }

    pub fn into_filter(self) -> TrackFilter {
        Arc::new(move |track| self.is_allowed(track))
    }
}

#[derive(Clone)]
pub struct EnqueuePolicy {
    pub filter: TrackFilter,
    /// `Duration::ZERO` means unlimited.
    pub max_track_length: Duration,
    pub max_queue_size: usize,
    pub shuffle_after: bool,
}

impl EnqueuePolicy {
    pub fn permissive(max_queue_size: usize) -> Self {
        Self {
            filter: Arc::new(|_| true),
            max_track_length: Duration::ZERO,
            max_queue_size,
            shuffle_after: false,
        }
    }
}

impl fmt::Debug for EnqueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueuePolicy")
            .field("max_track_length", &self.max_track_length)
            .field("max_queue_size", &self.max_queue_size)
            .field("shuffle_after", &self.shuffle_after)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rejections {
    pub not_allowed: usize,
    pub queue_full: usize,
    pub too_long: usize,
}

impl Rejections {
    pub fn total(&self) -> usize {
        self.not_allowed + self.queue_full + self.too_long
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOutcome {
    pub accepted: Vec<ResolvedTrack>,
    pub rejected: Rejections,
    pub started_playback: bool,
    /// The node refused to start playback; the head track was put back.
    pub playback_error: Option<AudioError>,
}

/// Aplica la política del guild y agrega tracks a la cola viva.
pub struct EnqueueController {
    node: Arc<dyn AudioNode>,
}

impl EnqueueController {
    pub fn new(node: Arc<dyn AudioNode>) -> Self {
        Self { node }
    }

    pub async fn enqueue(
        &self,
        ctx: &RequestContext,
        player: &mut GuildPlayer,
        candidates: Vec<ResolvedTrack>,
        policy: &EnqueuePolicy,
    ) -> EnqueueOutcome {
        let mut outcome = EnqueueOutcome::default();

        for track in candidates {
            if !(policy.filter)(&track) {
                debug!("Track no permitido en guild {}: {}", ctx.guild_id, track.title);
                outcome.rejected.not_allowed += 1;
                continue;
            }
            if player.len() >= policy.max_queue_size {
                outcome.rejected.queue_full += 1;
                continue;
            }
            if !policy.max_track_length.is_zero() && track.duration > policy.max_track_length {
                outcome.rejected.too_long += 1;
                continue;
            }
            player.push(QueueItem::new(track.clone(), ctx.requester));
            outcome.accepted.push(track);
        }

        if policy.shuffle_after && outcome.accepted.len() > 1 {
            player.shuffle_tail(outcome.accepted.len());
        }

        info!(
            "➕ {} canciones agregadas en guild {} ({} rechazadas)",
            outcome.accepted.len(),
            ctx.guild_id,
            outcome.rejected.total()
        );

        if !player.is_playing() {
            if let Some(item) = player.advance() {
                match self.node.play(ctx.guild_id, &item.track).await {
                    Ok(()) => outcome.started_playback = true,
                    Err(e) => {
                        warn!("⚠️ No se pudo iniciar la reproducción en guild {}: {}", ctx.guild_id, e);
                        player.requeue_current();
                        outcome.playback_error = Some(e);
                    }
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::node::MockAudioNode;
    use crate::audio::track::sample_track;
    use crate::context::{GuildId, UserId};
    use pretty_assertions::assert_eq;

    fn ctx() -> RequestContext {
        RequestContext::new(1, 10, 100)
    }

    fn titles(player: &GuildPlayer) -> Vec<String> {
        player.items().map(|i| i.track.title.clone()).collect()
    }

    fn idle_node() -> MockAudioNode {
        let mut node = MockAudioNode::new();
        node.expect_play().returning(|_, _| Ok(()));
        node
    }

    #[tokio::test]
    async fn test_queue_size_limit_keeps_input_order() {
        let controller = EnqueueController::new(Arc::new(MockAudioNode::new()));
        let mut player = GuildPlayer::new(GuildId(10));
        player.push(QueueItem::new(sample_track("playing", 10), UserId(1)));
        player.advance();

        let outcome = controller
            .enqueue(
                &ctx(),
                &mut player,
                vec![sample_track("a", 10), sample_track("b", 10), sample_track("c", 10)],
                &EnqueuePolicy::permissive(2),
            )
            .await;

        let accepted: Vec<_> = outcome.accepted.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(accepted, vec!["a", "b"]);
        assert_eq!(outcome.rejected, Rejections { queue_full: 1, ..Default::default() });
        assert_eq!(titles(&player), vec!["a", "b"]);
        assert!(!outcome.started_playback);
    }

    #[tokio::test]
    async fn test_rejections_by_reason() {
        let controller = EnqueueController::new(Arc::new(idle_node()));
        let mut player = GuildPlayer::new(GuildId(10));
        let policy = EnqueuePolicy {
            filter: AllowList::new(&[], &["nightcore".to_string()]).into_filter(),
            max_track_length: Duration::from_secs(600),
            max_queue_size: 100,
            shuffle_after: false,
        };

        let mut banned = sample_track("song", 100);
        banned.title = "Song (Nightcore Remix)".into();
        let outcome = controller
            .enqueue(
                &ctx(),
                &mut player,
                vec![banned, sample_track("long", 3600), sample_track("ok", 200)],
                &policy,
            )
            .await;

        assert_eq!(
            outcome.rejected,
            Rejections { not_allowed: 1, queue_full: 0, too_long: 1 }
        );
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_player_starts_playback() {
        let mut node = MockAudioNode::new();
        node.expect_play()
            .withf(|guild, track| *guild == GuildId(10) && track.title == "first")
            .times(1)
            .returning(|_, _| Ok(()));
        let controller = EnqueueController::new(Arc::new(node));
        let mut player = GuildPlayer::new(GuildId(10));

        let outcome = controller
            .enqueue(
                &ctx(),
                &mut player,
                vec![sample_track("first", 10), sample_track("second", 10)],
                &EnqueuePolicy::permissive(10),
            )
            .await;

        assert!(outcome.started_playback);
        assert_eq!(player.current().unwrap().track.title, "first");
        assert_eq!(titles(&player), vec!["second"]);
    }

    #[tokio::test]
    async fn test_failed_playback_keeps_outcome_and_retries_next_time() {
        let mut node = MockAudioNode::new();
        let mut calls = 0;
        node.expect_play()
            .withf(|_, track| track.title == "a")
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Err(AudioError::UpstreamTransient("node busy".into()))
                } else {
                    Ok(())
                }
            });
        let controller = EnqueueController::new(Arc::new(node));
        let mut player = GuildPlayer::new(GuildId(10));
        let policy = EnqueuePolicy::permissive(2);

        let outcome = controller
            .enqueue(
                &ctx(),
                &mut player,
                vec![sample_track("a", 10), sample_track("b", 10), sample_track("c", 10)],
                &policy,
            )
            .await;

        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.rejected.queue_full, 1);
        assert!(!outcome.started_playback);
        assert_eq!(outcome.playback_error, Some(AudioError::UpstreamTransient("node busy".into())));
        assert!(!player.is_playing());
        assert_eq!(titles(&player), vec!["a", "b"]);

        let outcome = controller.enqueue(&ctx(), &mut player, vec![], &policy).await;
        assert!(outcome.started_playback);
        assert_eq!(player.current().unwrap().track.title, "a");
    }

    #[tokio::test]
    async fn test_shuffle_only_moves_new_batch() {
        let controller = EnqueueController::new(Arc::new(MockAudioNode::new()));
        let mut player = GuildPlayer::new(GuildId(10));
        for name in ["now", "old1", "old2"] {
            player.push(QueueItem::new(sample_track(name, 10), UserId(1)));
        }
        player.advance();

        let batch: Vec<_> = (0..15).map(|i| sample_track(&format!("new{i}"), 10)).collect();
        let policy = EnqueuePolicy {
            shuffle_after: true,
            ..EnqueuePolicy::permissive(100)
        };
        let outcome = controller.enqueue(&ctx(), &mut player, batch, &policy).await;

        let queued = titles(&player);
        assert_eq!(&queued[..2], &["old1".to_string(), "old2".to_string()]);
        assert_eq!(queued.len(), 17);
        let accepted: Vec<_> = outcome.accepted.iter().map(|t| t.title.clone()).collect();
        assert_eq!(accepted[0], "new0");
    }

    #[test]
    fn test_whitelist_wins() {
        let list = AllowList::new(&["lofi".to_string()], &["beats".to_string()]);
        let mut track = sample_track("x", 10);
        track.title = "LoFi beats to study".into();
        assert!(list.is_allowed(&track));
        track.title = "Metal".into();
        assert!(!list.is_allowed(&track));
    }
}
