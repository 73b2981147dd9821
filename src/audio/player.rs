use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::node::{AudioNode, SessionRestorer};
use super::track::ResolvedTrack;
use crate::context::{GuildId, UserId};

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub track: ResolvedTrack,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(track: ResolvedTrack, requested_by: UserId) -> Self {
        Self {
            track,
            requested_by,
            added_at: Utc::now(),
        }
    }
}

/// Cola de reproducción viva de un guild.
///
/// Only two things mutate it: the enqueue controller appending, and
/// [`GuildPlayer::advance`] when playback moves on.
#[derive(Debug)]
pub struct GuildPlayer {
    guild_id: GuildId,
    items: VecDeque<QueueItem>,
    current: Option<QueueItem>,
}

impl GuildPlayer {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            items: VecDeque::new(),
            current: None,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current(&self) -> Option<&QueueItem> {
        self.current.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    pub(crate) fn push(&mut self, item: QueueItem) {
        self.items.push_back(item);
    }

    /// Mezcla solo las últimas `count` entradas; lo que ya estaba en cola no se mueve.
    pub(crate) fn shuffle_tail(&mut self, count: usize) {
        let len = self.items.len();
        let start = len.saturating_sub(count);
        let mut rng = rand::thread_rng();
        self.items.make_contiguous()[start..].shuffle(&mut rng);
        debug!("🔀 {} canciones nuevas mezcladas en guild {}", len - start, self.guild_id);
    }

    /// Siguiente track (FIFO); lo marca como actual.
    pub fn advance(&mut self) -> Option<QueueItem> {
        self.current = self.items.pop_front();
        if let Some(item) = &self.current {
            info!("➡️ Siguiente en cola: {}", item.track.title);
        } else {
            info!("📭 Cola vacía en guild {}", self.guild_id);
        }
        self.current.clone()
    }

    /// Devuelve el track actual al frente de la cola (el nodo no lo aceptó).
    pub(crate) fn requeue_current(&mut self) {
        if let Some(item) = self.current.take() {
            self.items.push_front(item);
        }
    }

    /// Total length of what is queued after the current track.
    pub fn queue_duration(&self) -> Duration {
        self.items.iter().map(|i| i.track.duration).sum()
    }
}

/// Registro por proceso de los reproductores de cada guild.
#[derive(Debug, Default, Clone)]
pub struct PlayerRegistry {
    players: Arc<DashMap<GuildId, Arc<Mutex<GuildPlayer>>>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<Mutex<GuildPlayer>> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildPlayer::new(guild_id))))
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<Mutex<GuildPlayer>>> {
        self.players.get(&guild_id).map(|p| p.clone())
    }

    pub fn remove(&self, guild_id: GuildId) {
        self.players.remove(&guild_id);
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.players.iter().map(|e| *e.key()).collect()
    }

    pub fn clear(&self) {
        self.players.clear();
    }
}

/// Vuelve a enviar al nodo el track actual de cada guild tras reconectar.
pub struct PlayerRestorer {
    players: PlayerRegistry,
    node: Arc<dyn AudioNode>,
}

impl PlayerRestorer {
    pub fn new(players: PlayerRegistry, node: Arc<dyn AudioNode>) -> Self {
        Self { players, node }
    }
}

#[async_trait]
impl SessionRestorer for PlayerRestorer {
    async fn restore(&self) -> anyhow::Result<usize> {
        let mut restored = 0;
        for guild_id in self.players.guilds() {
            let Some(player) = self.players.get(guild_id) else {
                continue;
            };
            let current = player.lock().await.current().map(|i| i.track.clone());
            if let Some(track) = current {
                match self.node.play(guild_id, &track).await {
                    Ok(()) => restored += 1,
                    Err(e) => warn!("No se pudo restaurar el reproductor de guild {}: {}", guild_id, e),
                }
            }
        }
        Ok(restored)
    }
}
