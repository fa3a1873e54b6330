//! logsock: a concurrent TCP packet logging server
//!
//! Clients send newline-terminated packets. Each complete packet is
//! appended to a shared data file and the whole file is sent back over
//! the same connection.
//!
//! Features:
//! - One task per connection, any number of simultaneous clients
//! - Periodic `timestamp:` records in the same file
//! - Clean shutdown on SIGINT/SIGTERM, removing the data file
//! - Optional daemon mode and connection cap
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod daemon;
mod protocol;
mod server;
mod shutdown;
mod storage;
mod timestamp;

use config::Config;
use server::Server;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config)?;

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        timestamp_interval = ?config.timestamp_interval,
        max_packet_size = config.max_packet_size,
        max_connections = ?config.max_connections,
        daemon = config.daemon,
        "Starting logsock server"
    );

    let listener = server::bind_listener(config.listen).map_err(|e| {
        error!(address = %config.listen, error = %e, "Failed to bind");
        e
    })?;

    if config.daemon {
        if config.log_file.is_none() {
            warn!("Daemon mode without a log file, further logs are discarded");
        }
        info!("Forking to run as daemon");
        daemon::daemonize()?;
    }

    // Built after daemonizing so no worker thread is lost across fork.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("logsock-worker")
        .build()?;

    runtime.block_on(serve(config, listener))?;

    Ok(())
}

async fn serve(config: Config, listener: std::net::TcpListener) -> std::io::Result<()> {
    let server = Server::new(config);
    shutdown::spawn_signal_listener(server.shutdown_handle())?;
    server.run(listener).await
}

fn init_logging(config: &Config) -> std::io::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}
