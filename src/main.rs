use anyhow::Result;
use std::time::Duration;
use tracing::info;

use open_music_resolver::config::Config;
use open_music_resolver::AudioService;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_resolver=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Resolver v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());
    let interval = Duration::from_secs(config.maintenance_interval_secs);

    let service = AudioService::from_config(config).await?;
    service.start();
    service.spawn_maintenance(interval);

    info!("🚀 Servicio de audio iniciado");
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    service.shutdown().await;
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // En modo externo no hay Java que verificar
    if config.use_external_lavalink {
        println!("OK");
        return Ok(());
    }

    match config.managed_node_settings().preflight().await {
        Ok(java_major) => {
            println!("OK (Java {})", java_major);
            Ok(())
        }
        Err(e) => anyhow::bail!("Dependencias faltantes: {}", e),
    }
}
