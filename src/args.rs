use clap::Parser;
use std::path::PathBuf;

use rtcbridge::config;

#[derive(Parser, Debug)]
#[command(name = "rtcbridge")]
#[command(version)]
#[command(about = "Identifier-addressed bridge between a host and a WebRTC engine", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtcbridge.toml")]
    pub config: PathBuf,

    /// WebSocket bind address
    #[arg(long)]
    pub host: Option<String>,

    /// WebSocket port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of live connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// STUN server host
    #[arg(long)]
    pub stun_host: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max) = self.max_connections {
            config.bridge.max_connections = max;
        }
        if let Some(ref stun_host) = self.stun_host {
            config.engine.stun_host = stun_host.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_file_values() {
        let args = Args::parse_from(["rtcbridge", "--port", "9100", "--host", "127.0.0.1", "-v"]);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let args = Args::parse_from(["rtcbridge", "--config", "/nonexistent/rtcbridge.toml"]);
        let config = args.load_config().unwrap();
        assert_eq!(config.bridge.max_connections, 0);
    }
}
