use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use super::track::{LoadResult, ResolvedTrack};
use crate::context::GuildId;
use crate::error::{AudioError, NodeLinkError, NodeStartError};

/// Parámetros de conexión al nodo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secured: bool,
}

impl NodeEndpoint {
    pub fn base_url(&self) -> String {
        let scheme = if self.secured { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Operaciones de audio que el pipeline necesita del nodo.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AudioNode: Send + Sync {
    async fn load_tracks(&self, query: &str) -> Result<LoadResult, AudioError>;

    async fn play(&self, guild_id: GuildId, track: &ResolvedTrack) -> Result<(), AudioError>;
}

/// Control connection to the node.
#[async_trait]
pub trait NodeLink: Send + Sync {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<(), NodeLinkError>;

    async fn disconnect(&self);
}

/// A node process whose lifecycle this crate owns.
#[async_trait]
pub trait ManagedNode: Send {
    /// Launches the process and returns where it listens once it is ready.
    async fn start(&mut self) -> Result<NodeEndpoint, NodeStartError>;

    async fn shutdown(&mut self);
}

pub trait ManagedNodeFactory: Send + Sync {
    fn create(&self) -> Box<dyn ManagedNode>;
}

/// Restaura sesiones de reproducción tras (re)conectar.
#[async_trait]
pub trait SessionRestorer: Send + Sync {
    async fn restore(&self) -> anyhow::Result<usize>;
}
