//! rtcbridge - Main entry point
//!
//! Serves the host wire protocol over WebSocket on top of the webrtc-rs engine.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use rtcbridge::config::Config;
use rtcbridge::engine::webrtc_rs::WebRtcEngine;
use rtcbridge::{Orchestrator, WebSocketHost};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTCBRIDGE_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("rtcbridge v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config: {}, using defaults", e),
        None => info!("Loaded configuration from {:?}", args.config),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let engine = WebRtcEngine::new(config.engine.clone());
    let orchestrator = Orchestrator::new(engine, config.bridge.clone());
    let host = WebSocketHost::new(config.server.host.clone(), config.server.port, orchestrator.clone());

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
        }
        result = host.run() => {
            if let Err(e) = result {
                error!("WebSocket host failed: {}", e);
                orchestrator.shutdown();
                return Err(e);
            }
        }
    }

    orchestrator.shutdown();
    info!("rtcbridge stopped");
    Ok(())
}
