use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

use super::YouTubeApi;
use crate::error::AudioError;

const SEARCH_URL: &str = "https://www.googleapis.com/youtube/v3/search";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: VideoId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoId {
    video_id: Option<String>,
}

/// Cliente de YouTube Data API v3 (solo búsqueda).
pub struct YouTubeClient {
    client: reqwest::Client,
    api_key: String,
}

impl YouTubeClient {
    pub fn new(api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Error al crear cliente HTTP para YouTube")?;

        Ok(Self { client, api_key })
    }
}

#[async_trait]
impl YouTubeApi for YouTubeClient {
    async fn get_call(&self, descriptor: &str) -> Result<Option<String>, AudioError> {
        if self.api_key.is_empty() {
            return Err(AudioError::UpstreamAuth("YouTube API key is not configured".into()));
        }
        debug!("🔍 Búsqueda YouTube API v3: {}", descriptor);

        let response = self
            .client
            .get(SEARCH_URL)
            .query(&[
                ("part", "id"),
                ("maxResults", "1"),
                ("type", "video"),
                ("q", descriptor),
                ("key", &self.api_key),
            ])
            .send()
            .await
            .map_err(AudioError::transient)?;

        let status = response.status();
        if !status.is_success() {
            error!("❌ YouTube API error: {}", status);
            return Err(status_error(status));
        }

        let body: SearchResponse = response.json().await.map_err(AudioError::transient)?;
        Ok(first_video_url(body))
    }
}

fn status_error(status: StatusCode) -> AudioError {
    match status {
        // clave inválida o cuota agotada
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => {
            AudioError::UpstreamAuth(format!("YouTube API returned HTTP {status}"))
        }
        _ => AudioError::UpstreamTransient(format!("YouTube API returned HTTP {status}")),
    }
}

fn first_video_url(body: SearchResponse) -> Option<String> {
    body.items
        .into_iter()
        .find_map(|item| item.id.video_id)
        .map(|id| format!("https://www.youtube.com/watch?v={id}"))
}
