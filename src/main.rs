use autoskip_for_plex::config::Config;
use autoskip_for_plex::custom_entries::CustomEntries;
use autoskip_for_plex::server::PlexServer;
use autoskip_for_plex::skipper::Skipper;
use clap::Parser;
use fs2::FileExt;
use log::{error, info};
use simplelog::{CombinedLogger, Config as LogConfig, LevelFilter, SimpleLogger, WriteLogger};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "autoskip-for-plex", version, about = "Automatic intro/credit/commercial skipping for Plex playback sessions")]
struct Args {
    /// Alternate configuration file location
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn acquire_instance_lock() -> Option<File> {
    let lock_path = Config::app_dir().join("autoskip-for-plex.lock");
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let lock_file = File::create(&lock_path).ok()?;
    lock_file.try_lock_exclusive().ok()?;
    Some(lock_file)
}

fn init_logging(verbose: bool) {
    let log_path = Config::log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let level = if verbose { LevelFilter::Trace } else { LevelFilter::Debug };
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> =
        vec![SimpleLogger::new(level, LogConfig::default())];
    if let Ok(file) = File::create(&log_path) {
        loggers.push(WriteLogger::new(level, LogConfig::default(), file));
    }
    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    info!("Starting Autoskip for Plex");
    info!("Log file: {}", log_path.display());
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let _lock_file = match acquire_instance_lock() {
        Some(f) => f,
        None => {
            eprintln!("Another instance is already running");
            std::process::exit(1);
        }
    };

    init_logging(Config::verbose());

    let config_path = Config::resolve_path(args.config.as_deref());
    let config = Arc::new(Config::load(&config_path));

    let custom_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(Config::app_dir);
    let custom = CustomEntries::load_dir(&custom_dir);

    let server = match PlexServer::connect(&config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Unable to connect to a Plex server: {}", e);
            std::process::exit(1);
        }
    };

    let skipper = Skipper::new(server, config, custom).await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    skipper.run(cancel).await;
    info!("Shutting down");
}
