use parking_lot::Mutex as SyncMutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::node::{ManagedNode, ManagedNodeFactory, NodeEndpoint, NodeLink, SessionRestorer};
use crate::error::{AudioError, NodeLinkError, NodeStartError};

/// Estado global de la conexión con el nodo de audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeConnectionState {
    Disconnected,
    Starting,
    Connected,
    Aborted,
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeConnectionState::Disconnected => "disconnected",
            NodeConnectionState::Starting => "starting",
            NodeConnectionState::Connected => "connected",
            NodeConnectionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Managed: this process launches the node. External: someone else runs it.
#[derive(Clone)]
pub enum NodeMode {
    Managed(Arc<dyn ManagedNodeFactory>),
    External(NodeEndpoint),
}

impl NodeMode {
    fn is_managed(&self) -> bool {
        matches!(self, NodeMode::Managed(_))
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_start_attempts: u32,
    pub max_connect_attempts: u32,
    pub handshake_timeout: Duration,
    pub retry_backoff: Duration,
    /// Pause before restoring players against an external node.
    pub external_settle_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_start_attempts: 5,
            max_connect_attempts: 5,
            handshake_timeout: Duration::from_secs(50),
            retry_backoff: Duration::from_secs(1),
            external_settle_delay: Duration::from_secs(5),
        }
    }
}

struct Inner {
    mode: NodeMode,
    link: Arc<dyn NodeLink>,
    restorer: Arc<dyn SessionRestorer>,
    settings: SupervisorSettings,
    state: watch::Sender<NodeConnectionState>,
    managed: Mutex<Option<Box<dyn ManagedNode>>>,
    restore_task: SyncMutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct Tasks {
    token: Option<CancellationToken>,
    connect: Option<JoinHandle<()>>,
}

/// Supervisor de la conexión con Lavalink.
///
/// Owns the managed node process (if any), runs the bounded-retry
/// startup/handshake sequence on a background task and restores player
/// sessions once connected. `Aborted` is sticky: only [`restart`] builds a
/// fresh supervisor that may try again.
///
/// [`restart`]: NodeConnectionSupervisor::restart
pub struct NodeConnectionSupervisor {
    inner: Arc<Inner>,
    tasks: SyncMutex<Tasks>,
}

impl NodeConnectionSupervisor {
    pub fn new(
        mode: NodeMode,
        link: Arc<dyn NodeLink>,
        restorer: Arc<dyn SessionRestorer>,
        settings: SupervisorSettings,
    ) -> Self {
        let (state, _) = watch::channel(NodeConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                mode,
                link,
                restorer,
                settings,
                state,
                managed: Mutex::new(None),
                restore_task: SyncMutex::new(None),
            }),
            tasks: SyncMutex::new(Tasks::default()),
        }
    }

    pub fn state(&self) -> NodeConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeConnectionState> {
        self.inner.state.subscribe()
    }

    /// Espera hasta que el intento de conexión termine (conectado o abortado).
    pub async fn wait_settled(&self) -> NodeConnectionState {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|s| matches!(s, NodeConnectionState::Connected | NodeConnectionState::Aborted))
            .await
            .map(|s| *s);
        settled.unwrap_or_else(|_| self.state())
    }

    /// Fails fast unless the node is connected.
    pub fn ensure_available(&self) -> Result<(), AudioError> {
        match self.state() {
            NodeConnectionState::Connected => Ok(()),
            NodeConnectionState::Aborted => Err(AudioError::ConnectionAborted),
            NodeConnectionState::Disconnected | NodeConnectionState::Starting => Err(AudioError::NodeNotReady),
        }
    }

    /// Lanza (o relanza) la tarea de conexión. No hace nada si está abortado.
    pub fn start(&self) {
        if self.state() == NodeConnectionState::Aborted {
            warn!("🚫 Conexión con Lavalink abortada, se requiere un reinicio explícito");
            return;
        }

        let mut tasks = self.tasks.lock();
        if let Some(token) = tasks.token.take() {
            token.cancel();
        }
        if let Some(handle) = self.inner.restore_task.lock().take() {
            handle.abort();
        }

        // la tarea anterior libera su nodo antes de que la nueva lance otro
        let previous = tasks.connect.take();
        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let task_token = token.clone();
        tasks.connect = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if task_token.is_cancelled() {
                return;
            }
            inner.run(task_token).await;
        }));
        tasks.token = Some(token);
    }

    /// Called when the control link to the node drops.
    pub fn on_link_dropped(&self) {
        if self.state() != NodeConnectionState::Connected {
            debug!("Caída de enlace ignorada en estado {}", self.state());
            return;
        }
        warn!("🔌 Conexión con Lavalink perdida, reconectando...");
        self.inner.state.send_replace(NodeConnectionState::Disconnected);
        self.start();
    }

    /// Cancels and awaits every owned task, then stops the managed node.
    pub async fn shutdown(&self) {
        let (token, connect) = {
            let mut tasks = self.tasks.lock();
            (tasks.token.take(), tasks.connect.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = connect {
            let _ = handle.await;
        }
        let restore = self.inner.restore_task.lock().take();
        if let Some(handle) = restore {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.link.disconnect().await;
        self.inner.stop_managed().await;
        if self.state() != NodeConnectionState::Aborted {
            self.inner.state.send_replace(NodeConnectionState::Disconnected);
        }
        info!("🛑 Supervisor de Lavalink detenido");
    }

    /// Tears this supervisor down and returns a fresh one (state
    /// `Disconnected`) already attempting to connect.
    pub async fn restart(&self) -> NodeConnectionSupervisor {
        self.shutdown().await;
        let fresh = NodeConnectionSupervisor::new(
            self.inner.mode.clone(),
            self.inner.link.clone(),
            self.inner.restorer.clone(),
            self.inner.settings.clone(),
        );
        fresh.start();
        fresh
    }
}

impl Inner {
    fn set_state(&self, state: NodeConnectionState) {
        self.state.send_replace(state);
    }

    async fn stop_managed(&self) {
        if let Some(mut node) = self.managed.lock().await.take() {
            node.shutdown().await;
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        // el futuro de conexión se descarta al salir del select, liberando el nodo gestionado
        let finished = tokio::select! {
            _ = token.cancelled() => None,
            state = self.clone().attempt_connect(token.clone()) => Some(state),
        };

        match finished {
            Some(state) => debug!("Tarea de conexión finalizada en estado {}", state),
            None => {
                debug!("Tarea de conexión cancelada");
                self.stop_managed().await;
                if *self.state.borrow() == NodeConnectionState::Starting {
                    self.set_state(NodeConnectionState::Disconnected);
                }
            }
        }
    }

    async fn attempt_connect(self: Arc<Self>, token: CancellationToken) -> NodeConnectionState {
        self.set_state(NodeConnectionState::Starting);

        let endpoint = match &self.mode {
            NodeMode::External(endpoint) => endpoint.clone(),
            NodeMode::Managed(factory) => match self.start_managed(factory.as_ref()).await {
                Some(endpoint) => endpoint,
                None => return self.abort(),
            },
        };

        let mut attempts = 0;
        let mut endpoint = endpoint;
        loop {
            if attempts >= self.settings.max_connect_attempts {
                error!("❌ La conexión con Lavalink falló tras {} intentos", attempts);
                return self.abort();
            }

            self.link.disconnect().await;
            let outcome = tokio::time::timeout(self.settings.handshake_timeout, self.link.connect(&endpoint)).await;
            match outcome {
                Ok(Ok(())) => break,
                Ok(Err(NodeLinkError::Timeout)) | Err(_) => {
                    attempts += 1;
                    warn!("⏰ Conexión con Lavalink expiró (intento {}), reintentando...", attempts);
                    if let NodeMode::Managed(factory) = &self.mode {
                        self.stop_managed().await;
                        if attempts < self.settings.max_connect_attempts {
                            match self.launch_once(factory.as_ref()).await {
                                Ok(fresh) => endpoint = fresh,
                                Err(e) if e.retryable => {
                                    warn!("No se pudo relanzar el nodo: {}", e);
                                }
                                Err(e) => {
                                    error!("❌ Error fatal relanzando el nodo Lavalink: {}", e);
                                    return self.abort();
                                }
                            }
                        }
                    }
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Ok(Err(NodeLinkError::Rejected(reason))) => {
                    error!("❌ Error no recuperable conectando con Lavalink: {}", reason);
                    return self.abort();
                }
            }
        }

        self.set_state(NodeConnectionState::Connected);
        info!("✅ Nodo Lavalink conectado en {}:{}", endpoint.host, endpoint.port);

        if !self.mode.is_managed() {
            tokio::time::sleep(self.settings.external_settle_delay).await;
        }
        self.spawn_restore(token);
        NodeConnectionState::Connected
    }

    /// Bounded-retry launch of the managed node. `None` means abort.
    async fn start_managed(&self, factory: &dyn ManagedNodeFactory) -> Option<NodeEndpoint> {
        let max = self.settings.max_start_attempts;
        for attempt in 1..=max {
            match self.launch_once(factory).await {
                Ok(endpoint) => return Some(endpoint),
                Err(e) if e.retryable => {
                    warn!("⚠️ Error arrancando el nodo gestionado (intento {}/{}): {}", attempt, max, e);
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
                Err(e) => {
                    error!("❌ Error fatal arrancando el nodo gestionado, abortando: {}", e);
                    return None;
                }
            }
        }
        error!("❌ El nodo gestionado no arrancó tras {} intentos", max);
        None
    }

    async fn launch_once(&self, factory: &dyn ManagedNodeFactory) -> Result<NodeEndpoint, NodeStartError> {
        self.stop_managed().await;
        let mut slot = self.managed.lock().await;
        let node = slot.insert(factory.create());
        match node.start().await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                if let Some(mut failed) = slot.take() {
                    failed.shutdown().await;
                }
                Err(e)
            }
        }
    }

    fn abort(&self) -> NodeConnectionState {
        self.set_state(NodeConnectionState::Aborted);
        NodeConnectionState::Aborted
    }

    fn spawn_restore(&self, token: CancellationToken) {
        let restorer = self.restorer.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Restauración de reproductores cancelada"),
                result = restorer.restore() => match result {
                    Ok(count) => info!("🔄 {} reproductores restaurados", count),
                    Err(e) => warn!("No se pudieron restaurar los reproductores: {:#}", e),
                },
            }
        });
        *self.restore_task.lock() = Some(handle);
    }
}
