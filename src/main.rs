//! vfs-adapter daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use vfs_adapter::config::{BackendConfig, Config};
use vfs_adapter::mount::MountManager;

const EXIT_USAGE: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_NO_MOUNTS: i32 = 3;
const EXIT_SIGNAL_HANDLER: i32 = 4;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: vfs-adapter <config.yaml>");
    eprintln!();
    eprintln!("vfs-adapter - serve a live clock file or mirror a host directory over FUSE");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  vfs-adapter /etc/vfs-adapter/config.yaml");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(EXIT_USAGE);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vfs-adapter starting");
    info!("Loaded configuration from {:?}", config_path);

    let manager = MountManager::new(tokio::runtime::Handle::current());

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        error!("Failed to install signal handler: {}", e);
        std::process::exit(EXIT_SIGNAL_HANDLER);
    }

    for mount_config in &config.mounts {
        let kind = match &mount_config.backend {
            BackendConfig::Clock(_) => "clock",
            BackendConfig::Loopback(_) => "loopback",
        };
        info!("Setting up {} mount at {:?}", kind, mount_config.path);

        if !mount_config.path.exists() {
            debug!("Creating mount point directory {:?}", mount_config.path);
            if let Err(e) = std::fs::create_dir_all(&mount_config.path) {
                error!(
                    "Failed to create mount point {:?}: {}",
                    mount_config.path, e
                );
                continue;
            }
        }

        if let Err(e) = manager.mount(mount_config) {
            error!("Failed to mount {:?}: {}", mount_config.path, e);
            continue;
        }
    }

    if manager.count() == 0 {
        error!("No filesystems were mounted successfully");
        std::process::exit(EXIT_NO_MOUNTS);
    }

    info!("{} filesystem(s) mounted successfully", manager.count());
    info!("Press Ctrl+C to unmount and exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(250)).await;
    }

    info!("Shutting down");
    manager.unmount_all().await;
    info!("All filesystems unmounted, exiting");
}
