//! Dockhand Engine - Entry Point
//!
//! Deploys compose stacks to remote servers over SSH and keeps their
//! reverse proxies reconciled.

use std::collections::HashMap;
use std::env;

use dockhand::app::options::AppOptions;
use dockhand::app::run::{run, AppState};
use dockhand::app::version_info;
use dockhand::logs::{init_logging, LogLevel, LogOptions};

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize version info: {}", e),
        }
        return;
    }

    // Initialize logging
    let log_level = cli_args
        .get("log-level")
        .and_then(|level| level.parse::<LogLevel>().ok())
        .unwrap_or_default();
    let log_options = LogOptions {
        log_level,
        json_format: cli_args.contains_key("log-json"),
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    // Run the engine
    let mut options = AppOptions::default();
    if cli_args.contains_key("no-proxy-check") {
        options.enable_proxy_check = false;
    }

    info!("Running dockhand engine {} with options: {:?}", version.version, options);
    let state = AppState::init(&options);
    let result = run(options, state, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the engine: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
