use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::node::{AudioNode, NodeEndpoint, NodeLink};
use super::track::{LoadResult, LoadType, ResolvedTrack};
use crate::context::GuildId;
use crate::error::{AudioError, NodeLinkError};

/// Cliente REST para un nodo Lavalink v4.
///
/// `connect` is the handshake: an authenticated `GET /v4/info`. Once it
/// succeeds the endpoint is remembered and track loading / playback go
/// through the same HTTP client. Player updates target the session id the
/// node was configured to resume.
pub struct LavalinkHttpClient {
    client: reqwest::Client,
    session_id: String,
    endpoint: RwLock<Option<NodeEndpoint>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
enum WireLoadResult {
    Track(WireTrack),
    Playlist(WirePlaylist),
    Search(Vec<WireTrack>),
    Empty(serde_json::Value),
    Error(WireException),
}

#[derive(Debug, Deserialize)]
struct WireTrack {
    encoded: String,
    info: WireTrackInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTrackInfo {
    identifier: String,
    is_seekable: bool,
    author: String,
    length: u64,
    is_stream: bool,
    title: String,
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePlaylist {
    info: WirePlaylistInfo,
    tracks: Vec<WireTrack>,
}

#[derive(Debug, Deserialize)]
struct WirePlaylistInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireException {
    message: Option<String>,
}

impl From<WireTrack> for ResolvedTrack {
    fn from(track: WireTrack) -> Self {
        Self {
            title: track.info.title,
            author: track.info.author,
            uri: track.info.uri.unwrap_or_default(),
            duration: Duration::from_millis(track.info.length),
            encoded: track.encoded,
            identifier: track.info.identifier,
            is_stream: track.info.is_stream,
            is_seekable: track.info.is_seekable,
            extras: Default::default(),
        }
    }
}

impl From<WireLoadResult> for LoadResult {
    fn from(wire: WireLoadResult) -> Self {
        match wire {
            WireLoadResult::Track(track) => LoadResult {
                load_type: LoadType::Track,
                playlist_name: None,
                tracks: vec![track.into()],
                error_message: None,
            },
            WireLoadResult::Playlist(playlist) => LoadResult {
                load_type: LoadType::Playlist,
                playlist_name: Some(playlist.info.name),
                tracks: playlist.tracks.into_iter().map(Into::into).collect(),
                error_message: None,
            },
            WireLoadResult::Search(tracks) => LoadResult {
                load_type: LoadType::Search,
                playlist_name: None,
                tracks: tracks.into_iter().map(Into::into).collect(),
                error_message: None,
            },
            WireLoadResult::Empty(_) => LoadResult::empty(),
            WireLoadResult::Error(exception) => {
                LoadResult::failed(exception.message.unwrap_or_else(|| "unknown error".to_string()))
            }
        }
    }
}

impl LavalinkHttpClient {
    pub fn new(session_id: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Error al crear cliente HTTP para Lavalink")?;

        Ok(Self {
            client,
            session_id: session_id.into(),
            endpoint: RwLock::new(None),
        })
    }

    fn current_endpoint(&self) -> Result<NodeEndpoint, AudioError> {
        self.endpoint.read().clone().ok_or(AudioError::NodeNotReady)
    }
}

#[async_trait]
impl NodeLink for LavalinkHttpClient {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<(), NodeLinkError> {
        info!("🎼 Conectando a Lavalink en {}:{}", endpoint.host, endpoint.port);

        let response = self
            .client
            .get(format!("{}/v4/info", endpoint.base_url()))
            .header("Authorization", &endpoint.password)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    NodeLinkError::Timeout
                } else {
                    NodeLinkError::Rejected(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("❌ Lavalink rechazó la conexión: {}", status);
            return Err(NodeLinkError::Rejected(format!("HTTP {status}")));
        }

        *self.endpoint.write() = Some(endpoint.clone());
        info!("✅ Conectado a Lavalink en {}:{}", endpoint.host, endpoint.port);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.endpoint.write().take().is_some() {
            debug!("Desconectado del nodo Lavalink");
        }
    }
}

#[async_trait]
impl AudioNode for LavalinkHttpClient {
    async fn load_tracks(&self, query: &str) -> Result<LoadResult, AudioError> {
        let endpoint = self.current_endpoint()?;
        let response = self
            .client
            .get(format!("{}/v4/loadtracks", endpoint.base_url()))
            .header("Authorization", &endpoint.password)
            .query(&[("identifier", query)])
            .send()
            .await
            .map_err(AudioError::transient)?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("Lavalink respondió {} al cargar '{}'", status, query);
            return Err(AudioError::UpstreamTransient(format!("loadtracks returned HTTP {status}")));
        }

        let wire: WireLoadResult = response.json().await.map_err(AudioError::transient)?;
        Ok(wire.into())
    }

    async fn play(&self, guild_id: GuildId, track: &ResolvedTrack) -> Result<(), AudioError> {
        let endpoint = self.current_endpoint()?;
        let url = format!(
            "{}/v4/sessions/{}/players/{}",
            endpoint.base_url(),
            urlencoding::encode(&self.session_id),
            guild_id
        );

        let response = self
            .client
            .patch(url)
            .header("Authorization", &endpoint.password)
            .json(&serde_json::json!({ "track": { "encoded": track.encoded } }))
            .send()
            .await
            .map_err(AudioError::transient)?;

        if !response.status().is_success() {
            return Err(AudioError::UpstreamTransient(format!(
                "player update returned HTTP {}",
                response.status()
            )));
        }

        info!("🎵 Reproduciendo '{}' en guild {}", track.title, guild_id);
        Ok(())
    }
}
