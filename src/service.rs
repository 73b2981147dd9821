//! # Audio Service
//!
//! Per-process owner of everything the resolver needs: the cache and its
//! deferred writes, the resolution pipeline, the live guild players, the
//! guild policy storage and the node connection supervisor.
//!
//! A host (chat bot, HTTP front-end, ...) builds one [`AudioService`],
//! calls [`AudioService::start`], and for every user action passes a
//! [`RequestContext`] to [`AudioService::play`]. Cache writes staged while
//! serving that action are flushed when `play` returns; whatever a host
//! stages on its own is flushed by [`AudioService::on_request_complete`] or
//! the periodic maintenance sweep.

use anyhow::Context;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::enqueue::EnqueueController;
use crate::audio::lavalink::LavalinkHttpClient;
use crate::audio::managed::LavalinkServerFactory;
use crate::audio::node::{AudioNode, NodeLink};
use crate::audio::player::{PlayerRegistry, PlayerRestorer};
use crate::audio::supervisor::{NodeConnectionSupervisor, NodeMode, SupervisorSettings};
use crate::audio::track::ResolvedTrack;
use crate::cache::{DeferredWriteQueue, FlushReport, MemoryCacheStore};
use crate::config::Config;
use crate::context::{GuildId, RequestContext, RequestId};
use crate::error::AudioError;
use crate::pipeline::{PipelineSettings, ProgressNotifier, ResolutionPipeline};
use crate::sources::{SpotifyApi, SpotifyClient, YouTubeApi, YouTubeClient};
use crate::storage::{GuildSettings, JsonStorage};

/// Resumen de un `play` para mostrar al usuario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayReport {
    pub added: usize,
    /// Rejected for queue size or track length.
    pub not_queued: usize,
    /// Rejected by the guild allow/deny lists.
    pub filtered: usize,
    /// The resolution stopped early at the consecutive-failure ceiling.
    pub aborted: bool,
    /// Tracks were queued but the node refused to start playing them.
    pub playback_failed: bool,
}

/// Collaborators that differ between production and tests.
pub struct ServiceParts {
    pub store: MemoryCacheStore,
    pub spotify: Arc<dyn SpotifyApi>,
    pub youtube: Arc<dyn YouTubeApi>,
    pub node: Arc<dyn AudioNode>,
    pub link: Arc<dyn NodeLink>,
    pub mode: NodeMode,
    pub storage: JsonStorage,
}

pub struct AudioService {
    config: Config,
    store: MemoryCacheStore,
    writes: Arc<DeferredWriteQueue>,
    pipeline: Arc<ResolutionPipeline>,
    enqueue: EnqueueController,
    players: PlayerRegistry,
    storage: Mutex<JsonStorage>,
    supervisor: RwLock<Arc<NodeConnectionSupervisor>>,
    maintenance: SyncMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl AudioService {
    pub fn new(config: Config, parts: ServiceParts) -> Self {
        let writes = Arc::new(DeferredWriteQueue::new(Arc::new(parts.store.clone())));
        let pipeline = Arc::new(ResolutionPipeline::new(
            Arc::new(parts.store.clone()),
            writes.clone(),
            parts.spotify,
            parts.youtube,
            parts.node.clone(),
            config.cache_level(),
            PipelineSettings {
                cache_age: config.cache_age(),
                consecutive_failure_limit: config.consecutive_failure_limit,
                autoplay_playlist: config.autoplay_playlist.clone(),
                ..PipelineSettings::default()
            },
        ));

        let players = PlayerRegistry::new();
        let restorer = Arc::new(PlayerRestorer::new(players.clone(), parts.node.clone()));
        let supervisor = NodeConnectionSupervisor::new(
            parts.mode,
            parts.link,
            restorer,
            SupervisorSettings {
                max_start_attempts: config.max_start_attempts,
                max_connect_attempts: config.max_connect_attempts,
                handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
                retry_backoff: Duration::from_millis(config.retry_backoff_ms),
                ..SupervisorSettings::default()
            },
        );

        Self {
            store: parts.store,
            writes,
            pipeline,
            enqueue: EnqueueController::new(parts.node),
            players,
            storage: Mutex::new(parts.storage),
            supervisor: RwLock::new(Arc::new(supervisor)),
            maintenance: SyncMutex::new(None),
            config,
        }
    }

    /// Construye el servicio con los clientes HTTP reales.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let lavalink = Arc::new(LavalinkHttpClient::new(config.lavalink_session_id.clone(), timeout)?);
        let spotify = SpotifyClient::new(
            config.spotify_client_id.clone(),
            config.spotify_client_secret.clone(),
            timeout,
        )?;
        let youtube = YouTubeClient::new(config.youtube_api_key.clone(), timeout)?;

        let store = MemoryCacheStore::new();
        match store.load_snapshot(&snapshot_path(&config)).await {
            Ok(count) => info!("🗄️ {} entradas de cache restauradas", count),
            Err(e) => warn!("⚠️ No se pudo restaurar el cache, se empieza vacío: {}", e),
        }

        let storage = JsonStorage::new(config.data_dir.clone())
            .await
            .context("Error al inicializar el almacenamiento de guilds")?;

        let mode = if config.use_external_lavalink {
            NodeMode::External(config.external_endpoint())
        } else {
            NodeMode::Managed(Arc::new(LavalinkServerFactory::new(config.managed_node_settings())))
        };

        Ok(Self::new(
            config,
            ServiceParts {
                store,
                spotify: Arc::new(spotify),
                youtube: Arc::new(youtube),
                node: lavalink.clone(),
                link: lavalink,
                mode,
                storage,
            },
        ))
    }

    pub fn start(&self) {
        self.supervisor().start();
    }

    pub fn supervisor(&self) -> Arc<NodeConnectionSupervisor> {
        self.supervisor.read().clone()
    }

    pub fn pipeline(&self) -> &ResolutionPipeline {
        &self.pipeline
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn writes(&self) -> &DeferredWriteQueue {
        &self.writes
    }

    pub async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        match self.storage.lock().await.get_guild_settings(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ Configuración de guild {} no disponible, usando valores por defecto: {}", guild_id, e);
                GuildSettings::new(guild_id)
            }
        }
    }

    pub async fn update_guild_settings(&self, settings: GuildSettings) -> anyhow::Result<()> {
        self.storage.lock().await.update_guild_settings(settings).await
    }

    /// Resuelve la consulta y la agrega a la cola del guild.
    pub async fn play(
        &self,
        ctx: &RequestContext,
        query: &str,
        notifier: &dyn ProgressNotifier,
    ) -> Result<PlayReport, AudioError> {
        let result = self.play_inner(ctx, query, notifier).await;
        self.on_request_complete(ctx.request_id).await;
        result
    }

    async fn play_inner(
        &self,
        ctx: &RequestContext,
        query: &str,
        notifier: &dyn ProgressNotifier,
    ) -> Result<PlayReport, AudioError> {
        self.supervisor().ensure_available()?;

        let settings = self.guild_settings(ctx.guild_id).await;
        let policy = settings.policy(self.config.max_queue_size);
        let resolution = self.pipeline.resolve(ctx, query, notifier, &policy.filter).await?;

        let player = self.players.get_or_create(ctx.guild_id);
        let outcome = {
            let mut player = player.lock().await;
            self.enqueue.enqueue(ctx, &mut player, resolution.tracks, &policy).await
        };

        Ok(PlayReport {
            added: outcome.accepted.len(),
            not_queued: outcome.rejected.queue_full + outcome.rejected.too_long,
            filtered: resolution.filtered + outcome.rejected.not_allowed,
            aborted: resolution.aborted,
            playback_failed: outcome.playback_error.is_some(),
        })
    }

    /// Encola un track de autoplay si el guild lo tiene activado y la cola
    /// está vacía. `Ok(None)` cuando no corresponde.
    pub async fn autoplay(&self, ctx: &RequestContext) -> Result<Option<ResolvedTrack>, AudioError> {
        let result = self.autoplay_inner(ctx).await;
        self.on_request_complete(ctx.request_id).await;
        result
    }

    async fn autoplay_inner(&self, ctx: &RequestContext) -> Result<Option<ResolvedTrack>, AudioError> {
        self.supervisor().ensure_available()?;

        let settings = self.guild_settings(ctx.guild_id).await;
        if !settings.autoplay {
            return Ok(None);
        }

        let player = self.players.get_or_create(ctx.guild_id);
        let mut player = player.lock().await;
        if player.is_playing() || !player.is_empty() {
            return Ok(None);
        }

        let policy = settings.policy(self.config.max_queue_size);
        let track = self
            .pipeline
            .autoplay(ctx, &policy.filter, settings.autoplaylist.as_deref())
            .await?;
        let outcome = self
            .enqueue
            .enqueue(ctx, &mut player, vec![track], &policy)
            .await;
        Ok(outcome.accepted.into_iter().next())
    }

    /// Hook de fin de petición: ejecuta sus escrituras de cache pendientes.
    pub async fn on_request_complete(&self, request_id: RequestId) -> FlushReport {
        self.writes.flush(request_id).await
    }

    /// Starts the periodic `flush_all` sweep. Calling it again replaces the
    /// running sweep.
    pub fn spawn_maintenance(&self, interval: Duration) {
        let token = CancellationToken::new();
        let writes = self.writes.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = writes.flush_all().await;
                        if report.executed + report.failed > 0 {
                            debug!(
                                "🧹 Barrido de mantenimiento: {} escrituras, {} fallidas",
                                report.executed, report.failed
                            );
                        }
                    }
                }
            }
        });

        if let Some((old, _)) = self.maintenance.lock().replace((token, handle)) {
            old.cancel();
        }
        info!("🧹 Barrido de mantenimiento cada {}", humantime::format_duration(interval));
    }

    /// Tears the node supervisor down and replaces it with a fresh one.
    /// This is the only way out of `Aborted`.
    pub async fn restart_node(&self) {
        info!("🔄 Reiniciando conexión con Lavalink");
        let fresh = self.supervisor().restart().await;
        *self.supervisor.write() = Arc::new(fresh);
    }

    pub async fn shutdown(&self) {
        info!("⚠️ Cerrando servicio de audio...");

        let sweep = self.maintenance.lock().take();
        if let Some((token, handle)) = sweep {
            token.cancel();
            let _ = handle.await;
        }

        let report = self.writes.flush_all().await;
        info!("💾 {} escrituras pendientes ejecutadas al cerrar", report.executed);

        let path = snapshot_path(&self.config);
        match self.store.save_snapshot(&path).await {
            Ok(count) => info!("🗄️ {} entradas de cache guardadas en {}", count, path.display()),
            Err(e) => error!("❌ No se pudo guardar el cache: {}", e),
        }

        self.supervisor().shutdown().await;
        self.players.clear();
    }
}

fn snapshot_path(config: &Config) -> PathBuf {
    config.data_dir.join("cache.json")
}
