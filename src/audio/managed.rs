use async_trait::async_trait;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::LazyLock,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, process::Child};
use tracing::{debug, error, info, warn};

use super::node::{ManagedNode, ManagedNodeFactory, NodeEndpoint};
use crate::error::NodeStartError;

const SUPPORTED_ARCHITECTURES: &[&str] = &["x86_64", "aarch64", "arm"];
const MIN_JAVA_MAJOR: u32 = 11;

static JAVA_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"version "(?:1\.)?(\d+)"#).expect("valid java version regex")
});

/// Where the managed node lives on disk.
#[derive(Debug, Clone)]
pub struct ManagedNodeSettings {
    pub java_path: PathBuf,
    /// Directory holding `Lavalink.jar` and `application.yml`.
    pub node_dir: PathBuf,
    pub ready_timeout: Duration,
}

impl ManagedNodeSettings {
    pub fn jar_path(&self) -> PathBuf {
        self.node_dir.join("Lavalink.jar")
    }

    pub fn config_path(&self) -> PathBuf {
        self.node_dir.join("application.yml")
    }

    /// Architecture, jar and Java runtime checks shared by node startup and
    /// the binary's `--health-check`. Returns the Java major version.
    pub async fn preflight(&self) -> Result<u32, NodeStartError> {
        check_architecture()?;

        let jar = self.jar_path();
        if !jar.exists() {
            return Err(NodeStartError::fatal(format!("Lavalink jar not found at {}", jar.display())));
        }

        java_major_version(&self.java_path).await
    }
}

/// Proceso Lavalink lanzado y supervisado localmente.
pub struct LavalinkServerManager {
    settings: ManagedNodeSettings,
    child: Option<Child>,
}

impl LavalinkServerManager {
    pub fn new(settings: ManagedNodeSettings) -> Self {
        Self {
            settings,
            child: None,
        }
    }

    async fn wait_until_ready(&mut self, endpoint: &NodeEndpoint) -> Result<(), NodeStartError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        let address = format!("{}:{}", endpoint.host, endpoint.port);

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(NodeStartError::retryable(format!(
                        "Lavalink exited during startup with {status}"
                    )));
                }
            }

            if TcpStream::connect(&address).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(NodeStartError::retryable(format!(
                    "Lavalink did not open {address} within {}",
                    humantime::format_duration(self.settings.ready_timeout)
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[async_trait]
impl ManagedNode for LavalinkServerManager {
    async fn start(&mut self) -> Result<NodeEndpoint, NodeStartError> {
        let java_major = self.settings.preflight().await?;
        let jar = self.settings.jar_path();
        let endpoint = read_node_config(&self.settings.config_path())?;
        info!("☕ Java {} detectado, lanzando Lavalink en el puerto {}", java_major, endpoint.port);

        let child = tokio::process::Command::new(&self.settings.java_path)
            .arg("-jar")
            .arg(&jar)
            .current_dir(&self.settings.node_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NodeStartError::retryable(format!("Failed to spawn Lavalink: {e}")))?;
        self.child = Some(child);

        if let Err(e) = self.wait_until_ready(&endpoint).await {
            self.shutdown().await;
            return Err(e);
        }

        info!("✅ Nodo Lavalink gestionado listo en {}:{}", endpoint.host, endpoint.port);
        Ok(endpoint)
    }

    async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("No se pudo detener el nodo Lavalink: {}", e);
            } else {
                debug!("Nodo Lavalink gestionado detenido");
            }
        }
    }
}

/// Crea un gestor nuevo en cada intento de arranque.
pub struct LavalinkServerFactory {
    settings: ManagedNodeSettings,
}

impl LavalinkServerFactory {
    pub fn new(settings: ManagedNodeSettings) -> Self {
        Self { settings }
    }
}

impl ManagedNodeFactory for LavalinkServerFactory {
    fn create(&self) -> Box<dyn ManagedNode> {
        Box::new(LavalinkServerManager::new(self.settings.clone()))
    }
}

fn check_architecture() -> Result<(), NodeStartError> {
    let arch = std::env::consts::ARCH;
    if SUPPORTED_ARCHITECTURES.contains(&arch) {
        Ok(())
    } else {
        Err(NodeStartError::fatal(format!(
            "Invalid machine architecture '{arch}', cannot run a managed Lavalink node"
        )))
    }
}

async fn java_major_version(java_path: &Path) -> Result<u32, NodeStartError> {
    let output = tokio::process::Command::new(java_path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| NodeStartError::fatal(format!("Java runtime not found at {}: {e}", java_path.display())))?;

    // `java -version` escribe en stderr
    let text = String::from_utf8_lossy(&output.stderr);
    let major = parse_java_major(&text)
        .ok_or_else(|| NodeStartError::fatal(format!("Unrecognized Java version output: {}", text.trim())))?;

    if major < MIN_JAVA_MAJOR {
        return Err(NodeStartError::fatal(format!(
            "Java {major} is too old, Lavalink needs Java {MIN_JAVA_MAJOR} or newer"
        )));
    }
    Ok(major)
}

fn parse_java_major(output: &str) -> Option<u32> {
    JAVA_VERSION
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Reads `server.address`, `server.port` and `lavalink.server.password` from
/// the node's `application.yml`.
pub fn read_node_config(path: &Path) -> Result<NodeEndpoint, NodeStartError> {
    let settings = config::Config::builder()
        .set_default("server.address", "localhost")
        .and_then(|b| b.set_default("server.port", 2333))
        .and_then(|b| b.set_default("lavalink.server.password", "youshallnotpass"))
        .map_err(|e| NodeStartError::fatal(e.to_string()))?
        .add_source(config::File::new(&path.to_string_lossy(), config::FileFormat::Yaml))
        .build()
        .map_err(|e| {
            error!("❌ Configuración de Lavalink inválida en {}: {}", path.display(), e);
            NodeStartError::fatal(format!("Invalid Lavalink config {}: {e}", path.display()))
        })?;

    let read = |key: &str| -> Result<String, NodeStartError> {
        settings
            .get_string(key)
            .map_err(|e| NodeStartError::fatal(format!("{key}: {e}")))
    };

    let mut host = read("server.address")?;
    // 0.0.0.0 escucha en todas las interfaces; nos conectamos por loopback
    if host == "0.0.0.0" {
        host = "localhost".to_string();
    }
    let port = settings
        .get_int("server.port")
        .ok()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| NodeStartError::fatal("server.port is not a valid port"))?;

    Ok(NodeEndpoint {
        host,
        port,
        password: read("lavalink.server.password")?,
        secured: false,
    })
}
