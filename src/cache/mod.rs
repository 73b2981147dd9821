//! # Cache Module
//!
//! Three-tier resolution cache used by the track resolution pipeline.
//!
//! Every user query travels through up to three lookups, and each one has
//! its own table:
//!
//! - **Spotify**: canonical `spotify:track:<id>` URI → track metadata
//! - **YouTube**: `"<track> <artist>"` descriptor → playable video URL
//! - **Lavalink**: normalized query → serialized [`LoadResult`]
//!
//! Which tables are active is controlled by [`CacheLevel`]. Reads go
//! straight to the [`CacheStore`]; writes are only ever staged on the
//! [`DeferredWriteQueue`] and executed when the request completes.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_LEVEL=7        # bitmask: 1 = lavalink, 2 = youtube, 4 = spotify
//! CACHE_AGE_DAYS=365   # entries older than this are treated as misses
//! ```
//!
//! [`LoadResult`]: crate::audio::track::LoadResult

pub mod deferred;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(test)]
use mockall::automock;

use crate::error::AudioError;

pub use deferred::{DeferredWriteQueue, FlushReport, WriteOp};
pub use memory::MemoryCacheStore;

/// One of the three cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Lavalink,
    YouTube,
    Spotify,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Lavalink, Tier::YouTube, Tier::Spotify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Lavalink => "lavalink",
            Tier::YouTube => "youtube",
            Tier::Spotify => "spotify",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Tier::Lavalink => 0b001,
            Tier::YouTube => 0b010,
            Tier::Spotify => 0b100,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitset de tiers activos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheLevel(u8);

impl CacheLevel {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self(0b111)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn with(self, tier: Tier) -> Self {
        Self(self.0 | tier.bit())
    }

    pub fn without(self, tier: Tier) -> Self {
        Self(self.0 & !tier.bit())
    }

    pub fn is_enabled(&self, tier: Tier) -> bool {
        self.0 & tier.bit() != 0
    }

    pub fn enabled_tiers(&self) -> Vec<Tier> {
        Tier::ALL.into_iter().filter(|t| self.is_enabled(*t)).collect()
    }
}

/// Clave de una fila: el tier más la clave de texto dentro de su tabla.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub tier: Tier,
    pub key: String,
}

impl CacheKey {
    pub fn lavalink(query: impl Into<String>) -> Self {
        Self {
            tier: Tier::Lavalink,
            key: query.into(),
        }
    }

    pub fn youtube(track_info: impl Into<String>) -> Self {
        Self {
            tier: Tier::YouTube,
            key: track_info.into(),
        }
    }

    pub fn spotify(uri: impl Into<String>) -> Self {
        Self {
            tier: Tier::Spotify,
            key: uri.into(),
        }
    }
}

/// Metadata stored in the `spotify` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotifyTrackRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    pub track_name: String,
    pub artist_name: String,
    pub song_url: Option<String>,
    pub track_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", content = "value", rename_all = "lowercase")]
pub enum CachePayload {
    /// Serialized `LoadResult` JSON.
    Lavalink(String),
    /// Playable URL.
    YouTube(String),
    Spotify(SpotifyTrackRecord),
}

impl CachePayload {
    pub fn tier(&self) -> Tier {
        match self {
            CachePayload::Lavalink(_) => Tier::Lavalink,
            CachePayload::YouTube(_) => Tier::YouTube,
            CachePayload::Spotify(_) => Tier::Spotify,
        }
    }
}

/// Fila a insertar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: String,
    pub payload: CachePayload,
    pub last_updated: i64,
    pub last_fetched: i64,
}

impl CacheRow {
    pub fn new(key: impl Into<String>, payload: CachePayload) -> Self {
        let now = now_timestamp();
        Self {
            key: key.into(),
            payload,
            last_updated: now,
            last_fetched: now,
        }
    }

    pub fn tier(&self) -> Tier {
        self.payload.tier()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: CachePayload,
    pub last_updated: i64,
    pub last_fetched: i64,
}

impl CacheEntry {
    /// Staleness is the caller's call; the store never expires anything.
    pub fn is_fresh(&self, not_older_than: i64) -> bool {
        self.last_updated >= not_older_than
    }
}

/// Persistencia clave-valor de los tres tiers.
///
/// Implementations fail with [`AudioError::StorageUnavailable`] when the
/// backing storage cannot be reached. Callers must treat that as a miss.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn fetch_one(&self, key: &CacheKey) -> Result<Option<CacheEntry>, AudioError>;

    async fn insert(&self, tier: Tier, rows: Vec<CacheRow>) -> Result<(), AudioError>;

    /// Refreshes `last_fetched`; a supplied payload also replaces the value
    /// and refreshes `last_updated`.
    async fn update(&self, key: &CacheKey, payload: Option<CachePayload>) -> Result<(), AudioError>;

    async fn fetch_random(&self, tier: Tier, not_older_than: i64) -> Result<Option<CacheEntry>, AudioError>;
}

pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
