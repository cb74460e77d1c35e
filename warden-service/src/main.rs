//! `warden-service` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): load config, rebuild grants and emergency
//!   state from the ledger, then serve the socket until Ctrl+C / SIGTERM.
//! - **`--ping`**: connect to the running service socket, send a hello
//!   handshake, verify the response, then exit.

use std::io::{BufRead, Write};
use std::sync::Arc;

use warden_core::{
    AccessManager, DirectorySnapshot, InMemoryDirectory, Ledger, LoggingDoorController,
    MemoryLedger, SqliteLedger,
};
use warden_service::config::{StorageBackend, WardenConfig};

fn ping(config: &WardenConfig) -> std::io::Result<()> {
    let path = config.resolved_socket_path();
    let mut stream = std::os::unix::net::UnixStream::connect(&path).map_err(|e| {
        std::io::Error::other(format!("ping: cannot connect to {}: {e}", path.display()))
    })?;
    stream.set_read_timeout(Some(std::time::Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(std::time::Duration::from_secs(5)))?;

    let hello = format!(
        r#"{{"id":0,"method":"hello","params":{{"protocol_version":"{}","client_version":"ping"}}}}"#,
        warden_service::PROTOCOL_VERSION,
    );
    stream.write_all(hello.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::other(format!("ping: invalid response JSON: {e}")))?;
    if resp.get("result").is_some() {
        eprintln!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        Err(std::io::Error::other(format!("ping: hello failed: {msg}")))
    }
}

fn main() -> std::io::Result<()> {
    let config = WardenConfig::load().map_err(std::io::Error::other)?;

    if std::env::args().nth(1).as_deref() == Some("--ping") {
        return ping(&config);
    }

    run_service(config)
}

fn open_ledger(config: &WardenConfig) -> std::io::Result<Arc<dyn Ledger>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryLedger::new())),
        StorageBackend::Sqlite => {
            let path = config.resolved_db_path();
            let ledger = SqliteLedger::open(&path).map_err(|e| {
                std::io::Error::other(format!("Failed to open ledger at {}: {e}", path.display()))
            })?;
            tracing::info!("Ledger at {}", path.display());
            Ok(Arc::new(ledger))
        }
    }
}

fn load_directory(config: &WardenConfig) -> std::io::Result<DirectorySnapshot> {
    let Some(path) = config.resolved_directory_path() else {
        tracing::warn!("No directory_path configured; starting with an empty directory");
        return Ok(DirectorySnapshot::default());
    };
    let snapshot = DirectorySnapshot::load_from_path(&path).map_err(std::io::Error::other)?;
    tracing::info!(
        identities = snapshot.identities.len(),
        access_points = snapshot.access_points.len(),
        zones = snapshot.zones.len(),
        templates = snapshot.templates.len(),
        "Directory loaded from {}",
        path.display()
    );
    Ok(snapshot)
}

#[tokio::main]
async fn run_service(config: WardenConfig) -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("warden-service v{} starting", env!("CARGO_PKG_VERSION"));

    let directory = Arc::new(InMemoryDirectory::new(load_directory(&config)?));
    let ledger = open_ledger(&config)?;
    let manager = AccessManager::bootstrap(
        directory,
        ledger,
        Arc::new(LoggingDoorController),
        config.manager_options(),
    )
    .await
    .map_err(|e| std::io::Error::other(format!("Failed to bootstrap access manager: {e}")))?;

    let socket_path = config.resolved_socket_path();
    let listener = warden_service::ipc::bind(&socket_path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mgr_signal = Arc::clone(&manager);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(
            "Signal received, shutting down (emergency phase: {})",
            mgr_signal.emergency().snapshot().phase.as_str()
        );
        let _ = shutdown_tx.send(true);
    });

    warden_service::ipc::serve(manager, listener, shutdown_rx).await?;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!("Socket cleanup skipped: {e}");
    }
    tracing::info!("warden-service exiting cleanly");
    Ok(())
}
