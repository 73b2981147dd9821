use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::audio::enqueue::{AllowList, EnqueuePolicy};
use crate::context::GuildId;

const MAX_QUEUE_SIZE_CAP: usize = 10_000;

/// Política de reproducción de un servidor, almacenada en JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: GuildId,
    /// 0 = sin límite
    pub max_track_length_secs: u64,
    pub shuffle: bool,
    pub max_queue_size: usize,
    pub autoplay: bool,
    /// Playlist propia para autoplay; sin ella se usa el cache o la global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoplaylist: Option<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl GuildSettings {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            max_track_length_secs: 0,
            shuffle: false,
            max_queue_size: MAX_QUEUE_SIZE_CAP,
            autoplay: false,
            autoplaylist: None,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(&self.whitelist, &self.blacklist)
    }

    /// Policy for one enqueue; the process-wide queue limit wins when lower.
    pub fn policy(&self, global_max_queue_size: usize) -> EnqueuePolicy {
        EnqueuePolicy {
            filter: self.allow_list().into_filter(),
            max_track_length: Duration::from_secs(self.max_track_length_secs),
            max_queue_size: self.max_queue_size.min(global_max_queue_size),
            shuffle_after: self.shuffle,
        }
    }
}

/// Manager de almacenamiento basado en archivos JSON, uno por guild
pub struct JsonStorage {
    data_dir: PathBuf,
    guilds_cache: HashMap<GuildId, GuildSettings>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let guilds_dir = data_dir.join("guilds");
        fs::create_dir_all(&guilds_dir)
            .await
            .with_context(|| format!("No se pudo crear {}", guilds_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let mut storage = Self {
            data_dir,
            guilds_cache: HashMap::new(),
        };
        storage.load_all_guilds().await?;

        Ok(storage)
    }

    /// Obtiene la política de un servidor, creándola por defecto si no existe
    pub async fn get_guild_settings(&mut self, guild_id: GuildId) -> Result<GuildSettings> {
        if let Some(settings) = self.guilds_cache.get(&guild_id) {
            return Ok(settings.clone());
        }

        match self.load_guild_settings(guild_id).await {
            Ok(settings) => {
                self.guilds_cache.insert(guild_id, settings.clone());
                Ok(settings)
            }
            Err(_) => {
                let settings = GuildSettings::new(guild_id);
                self.save_guild_settings(&settings).await?;
                self.guilds_cache.insert(guild_id, settings.clone());

                info!("📝 Configuración por defecto creada para guild {}", guild_id);
                Ok(settings)
            }
        }
    }

    pub async fn update_guild_settings(&mut self, settings: GuildSettings) -> Result<()> {
        let guild_id = settings.guild_id;
        self.save_guild_settings(&settings).await?;
        self.guilds_cache.insert(guild_id, settings);

        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }

    pub async fn set_shuffle(&mut self, guild_id: GuildId, shuffle: bool) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.shuffle = shuffle;
        self.update_guild_settings(settings).await
    }

    pub async fn set_autoplay(&mut self, guild_id: GuildId, autoplay: bool) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.autoplay = autoplay;
        self.update_guild_settings(settings).await
    }

    pub async fn set_autoplaylist(&mut self, guild_id: GuildId, url: Option<String>) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.autoplaylist = url.filter(|u| !u.trim().is_empty());
        self.update_guild_settings(settings).await
    }

    pub async fn set_max_track_length(&mut self, guild_id: GuildId, secs: u64) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.max_track_length_secs = secs;
        self.update_guild_settings(settings).await
    }

    pub async fn set_max_queue_size(&mut self, guild_id: GuildId, size: usize) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.max_queue_size = size.clamp(1, MAX_QUEUE_SIZE_CAP);
        self.update_guild_settings(settings).await
    }

    pub async fn set_lists(&mut self, guild_id: GuildId, whitelist: Vec<String>, blacklist: Vec<String>) -> Result<()> {
        let mut settings = self.get_guild_settings(guild_id).await?;
        settings.whitelist = whitelist;
        settings.blacklist = blacklist;
        self.update_guild_settings(settings).await
    }

    pub fn list_guilds(&self) -> Vec<GuildId> {
        self.guilds_cache.keys().copied().collect()
    }

    // Métodos privados

    async fn load_guild_settings(&self, guild_id: GuildId) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.guild_file_path(guild_id)).await?;
        let settings: GuildSettings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    async fn save_guild_settings(&self, settings: &GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.guild_file_path(settings.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_guilds(&mut self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("guilds")).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
                .map(GuildId)
            else {
                continue;
            };

            match self.load_guild_settings(guild_id).await {
                Ok(settings) => {
                    self.guilds_cache.insert(guild_id, settings);
                    loaded_count += 1;
                }
                Err(e) => warn!("Error cargando configuración para guild {}: {}", guild_id, e),
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} configuraciones de guild", loaded_count);
        }
        Ok(())
    }

    fn guild_file_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir.join("guilds").join(format!("guild_{}.json", guild_id))
    }
}
