use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Tier que está procesando la resolución.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Spotify,
    YouTube,
    Lavalink,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Spotify => "spotify",
            Phase::YouTube => "youtube",
            Phase::Lavalink => "lavalink",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub phase: Phase,
}

/// Receives progress while a collection resolves. Errors are ignored by the
/// pipeline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify(&self, progress: Progress) -> anyhow::Result<()>;
}

/// Descarta todo.
pub struct SilentNotifier;

#[async_trait]
impl ProgressNotifier for SilentNotifier {
    async fn notify(&self, _progress: Progress) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reenvía el progreso por un canal sin esperar al receptor.
///
/// A full channel drops the notification; a closed one is reported as an
/// error. Neither ever blocks the resolution.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Progress>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Progress>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ProgressNotifier for ChannelNotifier {
    async fn notify(&self, progress: Progress) -> anyhow::Result<()> {
        match self.tx.try_send(progress) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                debug!("Canal de progreso lleno, se descarta {}/{}", dropped.current, dropped.total);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => anyhow::bail!("progress receiver closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_reports_closed_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let notifier = ChannelNotifier::new(tx);
        let progress = Progress {
            current: 2,
            total: 10,
            phase: Phase::YouTube,
        };
        notifier.notify(progress).await.unwrap();
        assert_eq!(rx.recv().await, Some(progress));

        drop(rx);
        assert!(notifier.notify(progress).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_notifier_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = ChannelNotifier::new(tx);
        let progress = |current| Progress {
            current,
            total: 3,
            phase: Phase::Lavalink,
        };

        notifier.notify(progress(1)).await.unwrap();
        notifier.notify(progress(2)).await.unwrap();
        assert_eq!(rx.recv().await, Some(progress(1)));
        assert!(rx.try_recv().is_err());
    }
}
