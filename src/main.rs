//! getWork Mining Gateway - Main Application

use anyhow::{Context, Result};
use clap::Parser;
use getwork_gateway::config::{Cli, Config, DEFAULT_CONFIG_PATHS};
use getwork_gateway::frontend;
use getwork_gateway::logging::init_logging;
use getwork_gateway::{APP_NAME, APP_VERSION, Gateway, ShutdownCause};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = Config::locate(cli.config.as_deref());

    if cli.mkcfg {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATHS[0]));
        Config::default()
            .write_new(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let _guard = init_logging(&cli.log_level, cli.log_format, cli.log_file.as_deref())?;

    let config = match &path {
        Some(path) => load_config(path)?,
        None => {
            warn!("No config file found, using built-in defaults");
            Config::default()
        }
    };
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(run(config, path))
}

fn load_config(path: &Path) -> Result<Config> {
    let config =
        Config::read_file(path).with_context(|| format!("failed to load {}", path.display()))?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

async fn run(config: Config, path: Option<PathBuf>) -> Result<()> {
    info!(
        "Starting {} v{} with {} upstream(s), {} worker threads",
        APP_NAME,
        APP_VERSION,
        config.upstream.len(),
        config.worker_threads()
    );

    let gateway = Gateway::new(&config)?;
    let listen = config.listen_addr()?;

    tokio::spawn(handle_signals(Arc::clone(&gateway), path));

    if let Some(addr) = config.frontend_addr()? {
        tokio::spawn(frontend::serve(Arc::clone(&gateway), addr, config.frontend.clone()));
    }

    let result = Arc::clone(&gateway).run(listen).await;
    if let Some(cause) = gateway.shutdown().cause() {
        info!(%cause, "Gateway stopped");
    }
    result.map_err(Into::into)
}

#[cfg(unix)]
async fn handle_signals(gateway: Arc<Gateway>, path: Option<PathBuf>) {
    use tokio::signal::unix::{SignalKind, signal};

    let kinds = [
        (SignalKind::user_defined1(), "SIGUSR1"),
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
    ];
    let mut streams = Vec::new();
    for (kind, name) in kinds {
        match signal(kind) {
            Ok(stream) => streams.push((stream, name)),
            Err(e) => error!(signal = name, error = %e, "Failed to install signal handler"),
        }
    }
    if streams.is_empty() {
        return;
    }

    loop {
        let received = futures::future::select_all(
            streams
                .iter_mut()
                .map(|(stream, name)| Box::pin(async move { stream.recv().await.map(|_| *name) })),
        )
        .await
        .0;

        match received {
            Some("SIGUSR1") => reload(&gateway, path.as_deref()).await,
            Some(name) => {
                gateway
                    .shutdown()
                    .cancel(ShutdownCause::Signal(name.to_string()));
                return;
            }
            None => return,
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(gateway: Arc<Gateway>, _path: Option<PathBuf>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    gateway
        .shutdown()
        .cancel(ShutdownCause::Signal("ctrl-c".to_string()));
}

async fn reload(gateway: &Gateway, path: Option<&Path>) {
    let Some(path) = path else {
        warn!("Reload requested but no config file is in use");
        return;
    };
    info!(path = %path.display(), "Reloading configuration");
    match Config::load_from_file(path).await {
        Ok(config) => {
            if let Err(e) = gateway.reload_config(&config) {
                error!(error = %e, "Rejected reloaded configuration");
            }
        }
        Err(e) => error!(error = %e, "Failed to reload configuration"),
    }
}
