use regex::Regex;
use std::sync::LazyLock;

use crate::error::AudioError;
use crate::sources::SpotifyKind;

static SPOTIFY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://open\.spotify\.com/(?:intl-[a-z]+/)?|spotify:)(?P<kind>[a-z]+)[/:](?P<id>[A-Za-z0-9]+)",
    )
    .expect("valid spotify regex")
});

/// Consulta del usuario ya clasificada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Spotify { kind: SpotifyKind, id: String },
    Url(String),
    Local(String),
    Search(String),
}

impl Query {
    /// Classifies raw user input. Spotify links for anything other than a
    /// track, album or playlist are rejected as [`AudioError::UpstreamFormat`].
    pub fn parse(input: &str) -> Result<Self, AudioError> {
        let input = input.trim().trim_start_matches('<').trim_end_matches('>');
        if input.is_empty() {
            return Err(AudioError::NoResults("empty query".into()));
        }

        if let Some(caps) = SPOTIFY_URL.captures(input) {
            let kind = SpotifyKind::parse(&caps["kind"])
                .ok_or_else(|| AudioError::UpstreamFormat(format!("unsupported Spotify link: {input}")))?;
            return Ok(Query::Spotify {
                kind,
                id: caps["id"].to_string(),
            });
        }
        if input.starts_with("spotify:") || input.contains("open.spotify.com") {
            return Err(AudioError::UpstreamFormat(format!("invalid Spotify identifier: {input}")));
        }

        if let Some(path) = input.strip_prefix("file://") {
            return Ok(Query::Local(path.to_string()));
        }
        if input.starts_with('/') {
            return Ok(Query::Local(input.to_string()));
        }

        match url::Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Query::Url(input.to_string())),
            _ => Ok(Query::Search(input.to_string())),
        }
    }

    /// Identificador normalizado que se envía al nodo y se usa como clave del tier `lavalink`.
    pub fn lavalink_identifier(&self) -> String {
        match self {
            Query::Spotify { kind, id } => format!("spotify:{kind}:{id}"),
            Query::Url(url) => url.clone(),
            Query::Local(path) => path.clone(),
            Query::Search(text) if text.starts_with("ytsearch:") || text.starts_with("scsearch:") => text.clone(),
            Query::Search(text) => format!("ytsearch:{text}"),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Query::Local(_))
    }
}
