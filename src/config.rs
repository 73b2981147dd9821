use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::audio::managed::ManagedNodeSettings;
use crate::audio::node::NodeEndpoint;
use crate::cache::CacheLevel;
use crate::pipeline::DEFAULT_AUTOPLAY_PLAYLIST;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,

    // Cache
    pub cache_level: u8,
    pub cache_age_days: u64,

    // APIs
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub youtube_api_key: String,
    pub http_timeout_secs: u64,

    // Lavalink
    pub use_external_lavalink: bool,
    pub lavalink_host: String,
    pub lavalink_port: u16,
    pub lavalink_password: String,
    pub lavalink_secured: bool,
    pub lavalink_session_id: String,
    pub java_path: PathBuf,
    pub lavalink_dir: PathBuf,

    // Supervisión
    pub handshake_timeout_secs: u64,
    pub max_start_attempts: u32,
    pub max_connect_attempts: u32,
    pub retry_backoff_ms: u64,

    // Límites
    pub consecutive_failure_limit: usize,
    pub max_queue_size: usize,
    pub maintenance_interval_secs: u64,

    // Autoplay
    pub autoplay_playlist: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Paths
            data_dir: env_or("DATA_DIR", "/app/data").into(),

            // Cache
            cache_level: env_or("CACHE_LEVEL", "7").parse()?,
            cache_age_days: env_or("CACHE_AGE_DAYS", "365").parse()?,

            // APIs
            spotify_client_id: env_or("SPOTIFY_CLIENT_ID", ""),
            spotify_client_secret: env_or("SPOTIFY_CLIENT_SECRET", ""),
            youtube_api_key: env_or("YOUTUBE_API_KEY", ""),
            http_timeout_secs: env_or("HTTP_TIMEOUT", "10").parse()?,

            // Lavalink
            use_external_lavalink: env_or("USE_EXTERNAL_LAVALINK", "false").parse()?,
            lavalink_host: env_or("LAVALINK_HOST", "localhost"),
            lavalink_port: env_or("LAVALINK_PORT", "2333").parse()?,
            lavalink_password: env_or("LAVALINK_PASSWORD", "youshallnotpass"),
            lavalink_secured: env_or("LAVALINK_SECURED", "false").parse()?,
            lavalink_session_id: env_or("LAVALINK_SESSION_ID", "open-music-resolver"),
            java_path: env_or("JAVA_PATH", "java").into(),
            lavalink_dir: env_or("LAVALINK_DIR", "/app/lavalink").into(),

            // Supervisión
            handshake_timeout_secs: env_or("HANDSHAKE_TIMEOUT", "50").parse()?,
            max_start_attempts: env_or("MAX_START_ATTEMPTS", "5").parse()?,
            max_connect_attempts: env_or("MAX_CONNECT_ATTEMPTS", "5").parse()?,
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", "1000").parse()?,

            // Límites
            consecutive_failure_limit: env_or("CONSECUTIVE_FAILURE_LIMIT", "10").parse()?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "10000").parse()?,
            maintenance_interval_secs: env_or("MAINTENANCE_INTERVAL", "300").parse()?,

            // Autoplay
            autoplay_playlist: env_or("AUTOPLAY_PLAYLIST", DEFAULT_AUTOPLAY_PLAYLIST),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache level is a 3-bit mask (0-7)
    /// - Retry budgets and the failure ceiling must be at least 1
    /// - Queue size and maintenance interval must be greater than 0
    /// - The autoplay fallback playlist is a URL
    /// - An external node needs a host
    pub fn validate(&self) -> Result<()> {
        if self.cache_level > 7 {
            anyhow::bail!("Cache level must be between 0 and 7, got: {}", self.cache_level);
        }

        if self.max_start_attempts == 0 || self.max_connect_attempts == 0 {
            anyhow::bail!("Start and connect attempts must be greater than 0");
        }

        if self.consecutive_failure_limit == 0 {
            anyhow::bail!("Consecutive failure limit must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("Maintenance interval must be greater than 0");
        }

        if url::Url::parse(&self.autoplay_playlist).is_err() {
            anyhow::bail!("AUTOPLAY_PLAYLIST must be a URL, got: {}", self.autoplay_playlist);
        }

        if self.use_external_lavalink && self.lavalink_host.trim().is_empty() {
            anyhow::bail!("LAVALINK_HOST is required when USE_EXTERNAL_LAVALINK=true");
        }

        Ok(())
    }

    pub fn cache_level(&self) -> CacheLevel {
        CacheLevel::from_bits(self.cache_level)
    }

    pub fn cache_age(&self) -> Duration {
        Duration::from_secs(self.cache_age_days * 24 * 60 * 60)
    }

    pub fn external_endpoint(&self) -> NodeEndpoint {
        NodeEndpoint {
            host: self.lavalink_host.clone(),
            port: self.lavalink_port,
            password: self.lavalink_password.clone(),
            secured: self.lavalink_secured,
        }
    }

    pub fn managed_node_settings(&self) -> ManagedNodeSettings {
        ManagedNodeSettings {
            java_path: self.java_path.clone(),
            node_dir: self.lavalink_dir.clone(),
            ready_timeout: Duration::from_secs(self.handshake_timeout_secs),
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Credentials are reported only as set / unset.
    pub fn summary(&self) -> String {
        let set = |value: &str| if value.is_empty() { "unset" } else { "set" };
        format!(
            "Config Summary:\n  \
            Data: {}\n  \
            Cache: level {:?}, max age {} days\n  \
            APIs: Spotify {}, YouTube {}\n  \
            Lavalink: {} ({}:{}, session {})\n  \
            Retries: {} starts, {} connects, {}s handshake, {}ms backoff\n  \
            Limits: {} queue, {} consecutive failures, sweep every {}s",
            self.data_dir.display(),
            self.cache_level().enabled_tiers(),
            self.cache_age_days,
            set(&self.spotify_client_secret),
            set(&self.youtube_api_key),
            if self.use_external_lavalink { "external" } else { "managed" },
            self.lavalink_host,
            self.lavalink_port,
            self.lavalink_session_id,
            self.max_start_attempts,
            self.max_connect_attempts,
            self.handshake_timeout_secs,
            self.retry_backoff_ms,
            self.max_queue_size,
            self.consecutive_failure_limit,
            self.maintenance_interval_secs
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "/app/data".into(),

            cache_level: 7,
            cache_age_days: 365,

            spotify_client_id: String::new(),
            spotify_client_secret: String::new(),
            youtube_api_key: String::new(),
            http_timeout_secs: 10,

            use_external_lavalink: false,
            lavalink_host: "localhost".to_string(),
            lavalink_port: 2333,
            lavalink_password: "youshallnotpass".to_string(),
            lavalink_secured: false,
            lavalink_session_id: "open-music-resolver".to_string(),
            java_path: "java".into(),
            lavalink_dir: "/app/lavalink".into(),

            handshake_timeout_secs: 50,
            max_start_attempts: 5,
            max_connect_attempts: 5,
            retry_backoff_ms: 1000,

            consecutive_failure_limit: 10,
            max_queue_size: 10_000,
            maintenance_interval_secs: 300,

            autoplay_playlist: DEFAULT_AUTOPLAY_PLAYLIST.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Tier;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cache_level(), CacheLevel::all());
        assert_eq!(config.cache_age(), Duration::from_secs(365 * 86_400));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = Config {
            cache_level: 9,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_connect_attempts: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            autoplay_playlist: "top hits".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_credentials() {
        let config = Config {
            spotify_client_secret: "super-secret".into(),
            cache_level: 4,
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains(&format!("{:?}", vec![Tier::Spotify])));
    }
}
