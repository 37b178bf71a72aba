//! TempoSteps station
//!
//! Plays the catalog track whose tempo matches the walker's steps, as
//! reported by a tempo sensor on a serial port.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tempo_steps::catalog::Catalog;
use tempo_steps::cli::{self, ConsoleCommand, HELP};
use tempo_steps::config::{AppConfig, ConfigWatcher};
use tempo_steps::connection::{ConnectionManager, ConnectionSnapshot, ConnectionState};
use tempo_steps::decoder::TempoReading;
use tempo_steps::dispatcher::Dispatcher;
use tempo_steps::paths::AppPaths;
use tempo_steps::playback::{self, PlaybackController};
use tempo_steps::serial::{self, SystemPortOpener};
use tempo_steps::status::{spawn_status_ticker, StatusSources};

/// TempoSteps - play music that matches your walking tempo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (detected when omitted)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serial port of the sensor, overrides the config
    #[arg(short, long)]
    port: Option<String>,

    /// Track catalog file, overrides the config
    #[arg(long)]
    catalog: Option<String>,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,

    /// Run without the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let paths = match &args.config {
        Some(config) => {
            let base = Path::new(config)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            AppPaths {
                config: config.into(),
                logs_dir: base.join("logs"),
                is_portable: true,
            }
        }
        None => AppPaths::detect(),
    };

    let _log_guard = init_logging(&args.log_level, &paths)?;

    info!("Starting TempoSteps v{}...", env!("CARGO_PKG_VERSION"));
    info!("Base directory: {}", paths.base_dir().display());

    if args.list_ports {
        serial::list_ports_formatted();
        return Ok(());
    }

    let config_path = paths.config.to_string_lossy().to_string();
    let mut config = AppConfig::load_or_default(&config_path).await?;
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if let Some(catalog) = &args.catalog {
        config.catalog.path = catalog.clone();
    }
    config.validate()?;

    run_app(args, paths, config).await?;

    info!("TempoSteps shutdown complete");
    Ok(())
}

async fn run_app(args: Args, paths: AppPaths, mut config: AppConfig) -> Result<()> {
    let mut catalog = Catalog::new();
    let catalog_path = paths.resolve(&config.catalog.path);
    if let Err(e) = catalog.import_file(&catalog_path) {
        error!("❌ Catalog import failed: {}", e);
    }
    if catalog.is_empty() {
        warn!("⚠️  Catalog is empty, readings will not start any playback");
    }
    let catalog = Arc::new(catalog);

    let playback = PlaybackController::new(playback::default_backend());
    let (dispatcher, _match_worker) = Dispatcher::spawn(
        Arc::clone(&catalog),
        playback.clone(),
        config.dispatch.queue_capacity,
    );

    let connection = ConnectionManager::new(
        Arc::new(SystemPortOpener),
        config.serial.settings(),
        dispatcher.clone(),
    );
    connection.subscribe_connection_status(Arc::new(|snapshot: &ConnectionSnapshot| {
        match snapshot.state {
            ConnectionState::Connecting => info!("🔌 Connecting to {}...", snapshot.port),
            ConnectionState::Connected => info!("✅ Connected to {}", snapshot.port),
            ConnectionState::Disconnected => info!("Disconnected from {}", snapshot.port),
        }
    }));

    if config.serial.autoconnect {
        connection.request_connection(config.serial.port.clone());
    }

    let sources = StatusSources {
        connection: connection.clone(),
        dispatcher: dispatcher.clone(),
        playback: playback.clone(),
    };
    let ticker_cancel = CancellationToken::new();
    // The ticker stops once its receiver is dropped, so keep it for the whole run
    let _status_ticker = (config.status.interval_ms > 0).then(|| {
        spawn_status_ticker(
            sources.clone(),
            Duration::from_millis(config.status.interval_ms),
            Duration::from_millis(config.status.stale_after_ms),
            ticker_cancel.clone(),
        )
    });

    let mut config_watcher = if paths.config.exists() {
        match ConfigWatcher::new(paths.config.to_string_lossy().to_string()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config hot-reload disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let (console_tx, mut console_rx) = mpsc::channel::<ConsoleCommand>(16);
    if !args.no_console {
        std::thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                if let Err(e) = cli::run_console(console_tx) {
                    warn!("Console unavailable: {:#}", e);
                }
            })
            .context("Failed to start console thread")?;
    } else {
        drop(console_tx);
    }

    let stale_after = Duration::from_millis(config.status.stale_after_ms);
    info!("Ready, waiting for tempo readings");

    loop {
        tokio::select! {
            Some(command) = console_rx.recv() => match command {
                ConsoleCommand::Connect(port) => {
                    let port = port.unwrap_or_else(|| config.serial.port.clone());
                    connection.request_connection(port);
                }
                ConsoleCommand::Close => {
                    if !connection.close() {
                        println!("Not connected");
                    }
                }
                ConsoleCommand::Status => println!("{}", sources.sample(stale_after)),
                ConsoleCommand::Play(bpm) => {
                    dispatcher.submit(TempoReading::new(bpm));
                }
                ConsoleCommand::Help => println!("{}", HELP),
                ConsoleCommand::Quit => break,
            },

            Some(new_config) = next_config(&mut config_watcher) => {
                info!("📝 Configuration file changed, reloading...");
                if new_config.serial.port != config.serial.port {
                    info!("Sensor port changed to {}", new_config.serial.port);
                    connection.request_connection(new_config.serial.port.clone());
                }
                config = new_config;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down...");
    ticker_cancel.cancel();
    connection.close();
    playback.stop();

    Ok(())
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

fn init_logging(level: &str, paths: &AppPaths) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    // Logging to file is best effort; a read-only base dir only loses the file
    let (file_layer, guard) = match paths.ensure_directories() {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&paths.logs_dir, "tempo-steps.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("File logging disabled: {:#}", e);
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
