//! `siphon-controller`: accepts datapath node sessions and runs the control
//! plane against the shared store (Redis, or in-process when no store URL
//! is configured).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use siphon_core::ControllerConfig;
use siphon_core::logging;
use siphon_network::store::StoreConnector;
use siphon_network::{Controller, MemoryStore, RedisConnector, SessionAllocator, session_config};

#[derive(Debug, Parser)]
#[command(name = "siphon-controller", version, about = "Siphon overlay network controller")]
struct Cli {
    /// Listen port (same as --port).
    #[arg(value_name = "PORT")]
    listen_port: Option<u16>,

    /// Controller config file (JSON). Defaults to ~/.siphon/controller.json.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Shared store URL, e.g. redis://127.0.0.1:6379/0.
    #[arg(long, value_name = "URL")]
    store: Option<String>,

    /// Static session file with `PseudoSessions`.
    #[arg(long, value_name = "PATH")]
    sessions: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,

    /// Write daily-rolling log files into this directory.
    #[arg(long, value_name = "DIR", conflicts_with = "log_file")]
    log_dir: Option<PathBuf>,

    /// Write daily-rolling log files into ~/.siphon/logs.
    #[arg(long)]
    log_file: bool,

    /// Run the session-ID allocator in this process.
    #[arg(long)]
    allocator: bool,
}

impl Cli {
    fn resolve_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::load(path)?,
            None => ControllerConfig::default_path()
                .map(|path| ControllerConfig::load_or_default(&path))
                .unwrap_or_default(),
        };

        if let Some(port) = self.port.or(self.listen_port) {
            config.listen_addr.set_port(port);
        }
        if let Some(url) = &self.store {
            config.store_url = Some(url.clone());
        }
        if let Some(sessions) = &self.sessions {
            config.session_config_path = Some(sessions.clone());
        }
        if let Some(filter) = &self.log_filter {
            config.log.filter = filter.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log.dir = Some(dir.clone());
        } else if self.log_file {
            config.log.dir = Some(ControllerConfig::logs_dir()?);
        }
        if self.allocator {
            config.session_allocator = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("siphon-controller: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match logging::init_logging(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("siphon-controller: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("controller stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("controller failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ControllerConfig) -> Result<()> {
    let connector = open_store(&config)?;

    if let Some(path) = &config.session_config_path {
        let commands = connector
            .commands()
            .await
            .context("Shared store unavailable")?;
        if let Err(e) = session_config::load_into_store(path, commands.as_ref()).await {
            warn!("session configuration not loaded: {e}");
        }
        commands.disconnect().await;
    }

    let controller = Controller::new(config.clone(), Arc::clone(&connector));
    let listener = controller.bind().await?;

    if config.session_allocator {
        let _allocator =
            SessionAllocator::spawn(Arc::clone(&connector), controller.shutdown_signal().subscribe())
                .await
                .context("Failed to start session allocator")?;
        info!("session allocator running");
    }

    let shutdown = controller.shutdown_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown.send(());
            }
            Err(e) => warn!("cannot listen for interrupt: {e}"),
        }
    });

    controller.serve(listener).await?;
    Ok(())
}

fn open_store(config: &ControllerConfig) -> Result<Arc<dyn StoreConnector>> {
    match &config.store_url {
        Some(url) => {
            let connector = RedisConnector::open(url).context("Cannot use shared store")?;
            info!("using shared Redis store");
            Ok(Arc::new(connector))
        }
        None => {
            warn!("no store URL configured; state stays private to this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
