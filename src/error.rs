use thiserror::Error;

/// Errores del pipeline de resolución y de la conexión con el nodo de audio.
///
/// Cache and deferred-write failures never escape the pipeline: they are
/// logged and degraded to misses. Everything else reaches the caller so it
/// can tell "bad credentials" apart from "nothing found".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("cache storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("upstream rejected the configured credentials: {0}")]
    UpstreamAuth(String),

    #[error("unrecognized source identifier: {0}")]
    UpstreamFormat(String),

    #[error("upstream temporarily unavailable: {0}")]
    UpstreamTransient(String),

    #[error("nothing found for {0}")]
    NoResults(String),

    #[error("audio node connection aborted, an explicit restart is required")]
    ConnectionAborted,

    #[error("audio node is not connected yet")]
    NodeNotReady,
}

impl AudioError {
    /// `true` for errors that must stop a resolution instead of counting as
    /// a per-member failure.
    pub fn is_fatal_for_resolution(&self) -> bool {
        matches!(
            self,
            AudioError::UpstreamAuth(_)
                | AudioError::UpstreamFormat(_)
                | AudioError::ConnectionAborted
                | AudioError::NodeNotReady
        )
    }

    pub(crate) fn transient(err: reqwest::Error) -> Self {
        AudioError::UpstreamTransient(err.to_string())
    }
}

/// Fallo al lanzar el nodo gestionado.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NodeStartError {
    pub message: String,
    pub retryable: bool,
}

impl NodeStartError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Fallo del handshake con el nodo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeLinkError {
    #[error("handshake timed out")]
    Timeout,

    #[error("node rejected the connection: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AudioError::UpstreamAuth("401".into()).is_fatal_for_resolution());
        assert!(AudioError::ConnectionAborted.is_fatal_for_resolution());
        assert!(!AudioError::UpstreamTransient("timeout".into()).is_fatal_for_resolution());
        assert!(!AudioError::StorageUnavailable("io".into()).is_fatal_for_resolution());
    }
}
