use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// A playable track as returned by the Lavalink tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTrack {
    pub title: String,
    pub author: String,
    pub uri: String,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Identificador opaco que el nodo necesita para reproducir.
    pub encoded: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub is_seekable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extras: HashMap<String, serde_json::Value>,
}

impl ResolvedTrack {
    /// Texto usado por las listas de permitidos/bloqueados.
    pub fn filter_text(&self) -> String {
        format!("{} {} {}", self.title, self.author, self.uri)
    }

    pub fn mark_autoplay(&mut self) {
        self.extras
            .insert("autoplay".to_string(), serde_json::Value::Bool(true));
    }

    pub fn is_autoplay(&self) -> bool {
        self.extras
            .get("autoplay")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

/// Resultado de `load_tracks`, también el payload del tier `lavalink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub load_type: LoadType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_name: Option<String>,
    #[serde(default)]
    pub tracks: Vec<ResolvedTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl LoadResult {
    pub fn empty() -> Self {
        Self {
            load_type: LoadType::Empty,
            playlist_name: None,
            tracks: Vec::new(),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            load_type: LoadType::Error,
            playlist_name: None,
            tracks: Vec::new(),
            error_message: Some(message.into()),
        }
    }

    pub fn has_error(&self) -> bool {
        self.load_type == LoadType::Error
    }

    /// Search results only ever contribute their best match.
    pub fn playable(&self) -> Vec<ResolvedTrack> {
        match self.load_type {
            LoadType::Search => self.tracks.iter().take(1).cloned().collect(),
            LoadType::Track | LoadType::Playlist => self.tracks.clone(),
            LoadType::Empty | LoadType::Error => Vec::new(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
pub(crate) fn sample_track(title: &str, secs: u64) -> ResolvedTrack {
    ResolvedTrack {
        title: title.to_string(),
        author: "Artist".to_string(),
        uri: format!("https://www.youtube.com/watch?v={title}"),
        duration: Duration::from_secs(secs),
        encoded: format!("enc-{title}"),
        identifier: title.to_string(),
        is_stream: false,
        is_seekable: true,
        extras: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_search_result_keeps_best_match_only() {
        let result = LoadResult {
            load_type: LoadType::Search,
            playlist_name: None,
            tracks: vec![sample_track("a", 10), sample_track("b", 10)],
            error_message: None,
        };
        let playable = result.playable();
        assert_eq!(playable.len(), 1);
        assert_eq!(playable[0].title, "a");
    }

    #[test]
    fn test_cached_payload_survives_serialization() {
        let mut track = sample_track("x", 215);
        track.mark_autoplay();
        let result = LoadResult {
            load_type: LoadType::Track,
            playlist_name: None,
            tracks: vec![track],
            error_message: None,
        };
        let raw = serde_json::to_string(&result).unwrap();
        let back: LoadResult = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, result);
        assert!(back.tracks[0].is_autoplay());
    }
}
