use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use std::{
    fmt,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::SpotifyApi;
use crate::cache::SpotifyTrackRecord;
use crate::error::AudioError;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Tipo de recurso de Spotify que acepta el pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpotifyKind {
    Track,
    Album,
    Playlist,
}

impl SpotifyKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "track" => Some(SpotifyKind::Track),
            "album" => Some(SpotifyKind::Album),
            "playlist" => Some(SpotifyKind::Playlist),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpotifyKind::Track => "track",
            SpotifyKind::Album => "album",
            SpotifyKind::Playlist => "playlist",
        }
    }

    /// First URL to request. Collections go through their `/tracks` paging
    /// endpoint so every page has the same shape.
    pub fn api_url(&self, id: &str) -> String {
        match self {
            SpotifyKind::Track => format!("{API_BASE}/tracks/{id}"),
            SpotifyKind::Album => format!("{API_BASE}/albums/{id}/tracks?limit=50"),
            SpotifyKind::Playlist => format!("{API_BASE}/playlists/{id}/tracks?limit=100"),
        }
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self, SpotifyKind::Track)
    }
}

impl fmt::Display for SpotifyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Cliente de la Web API de Spotify con credenciales de aplicación.
pub struct SpotifyClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyClient {
    pub fn new(client_id: String, client_secret: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Error al crear cliente HTTP para Spotify")?;

        Ok(Self {
            client,
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, AudioError> {
        let mut token = self.token.lock().await;
        if let Some(current) = token.as_ref() {
            if current.expires_at > Instant::now() {
                return Ok(current.value.clone());
            }
        }

        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AudioError::UpstreamAuth("Spotify credentials are not configured".into()));
        }

        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.client_id, self.client_secret));
        let response = self
            .client
            .post(TOKEN_URL)
            .header("Authorization", format!("Basic {basic}"))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(AudioError::transient)?;

        let status = response.status();
        if !status.is_success() {
            error!("❌ Spotify rechazó las credenciales: {}", status);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AudioError::UpstreamAuth(format!("token request returned HTTP {status}"))
                }
                _ => AudioError::UpstreamTransient(format!("token request returned HTTP {status}")),
            });
        }

        let body: TokenResponse = response.json().await.map_err(AudioError::transient)?;
        // se renueva un minuto antes de expirar
        let lifetime = Duration::from_secs(body.expires_in.saturating_sub(60));
        debug!("🔑 Token de Spotify renovado, válido por {}", humantime::format_duration(lifetime));
        *token = Some(AccessToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }
}

#[async_trait]
impl SpotifyApi for SpotifyClient {
    async fn get_call(&self, url: &str) -> Result<serde_json::Value, AudioError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(AudioError::transient)?;

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                // el próximo intento pide un token nuevo
                self.token.lock().await.take();
            }
            warn!("Spotify respondió {} para {}", status, url);
            return Err(status_error(status));
        }

        response.json().await.map_err(AudioError::transient)
    }
}

pub(crate) fn status_error(status: StatusCode) -> AudioError {
    match status {
        StatusCode::UNAUTHORIZED => AudioError::UpstreamAuth(format!("Spotify returned HTTP {status}")),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            AudioError::UpstreamFormat(format!("Spotify returned HTTP {status}"))
        }
        _ => AudioError::UpstreamTransient(format!("Spotify returned HTTP {status}")),
    }
}

/// Items and `next` link of one page, whether the page is a bare paging
/// object or a full album/playlist object that nests it under `tracks`.
pub(crate) fn page_parts(page: &serde_json::Value) -> (Vec<serde_json::Value>, Option<String>, Option<usize>) {
    let paging = match page.get("tracks") {
        Some(tracks) if tracks.get("items").is_some() => tracks,
        _ => page,
    };
    let items = paging
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();
    let next = paging.get("next").and_then(|n| n.as_str()).map(str::to_string);
    let total = paging.get("total").and_then(|t| t.as_u64()).map(|t| t as usize);
    (items, next, total)
}

/// Extrae la metadata de un track. Los items de playlist traen el track
/// anidado en `track`; los de álbum y `/tracks/{id}` lo traen directo.
pub fn track_record(item: &serde_json::Value) -> Option<SpotifyTrackRecord> {
    let track = match item.get("track") {
        Some(nested) if nested.is_object() => nested,
        Some(_) => return None,
        None => item,
    };

    let id = track.get("id")?.as_str()?.to_string();
    let track_name = track.get("name")?.as_str()?.to_string();
    let artist_name = track
        .get("artists")
        .and_then(|a| a.get(0))
        .and_then(|a| a.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let uri = track
        .get("uri")
        .and_then(|u| u.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("spotify:track:{id}"));

    Some(SpotifyTrackRecord {
        kind: track
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("track")
            .to_string(),
        song_url: track
            .get("external_urls")
            .and_then(|u| u.get("spotify"))
            .and_then(|u| u.as_str())
            .map(str::to_string),
        track_info: format!("{track_name} {artist_name}").trim().to_string(),
        id,
        uri,
        track_name,
        artist_name,
    })
}
