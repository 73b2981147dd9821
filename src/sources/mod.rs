pub mod spotify;
pub mod youtube;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::AudioError;

pub use spotify::{SpotifyClient, SpotifyKind};
pub use youtube::YouTubeClient;

/// Acceso crudo a la Web API de Spotify.
///
/// `url` is an absolute `https://api.spotify.com/v1/...` URL; paginated
/// responses hand back the next page URL in `next`, which is passed here
/// verbatim.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpotifyApi: Send + Sync {
    async fn get_call(&self, url: &str) -> Result<serde_json::Value, AudioError>;
}

/// Búsqueda de un video a partir de `"<track> <artist>"`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait YouTubeApi: Send + Sync {
    /// `Ok(None)` when the search returned no videos.
    async fn get_call(&self, descriptor: &str) -> Result<Option<String>, AudioError>;
}
