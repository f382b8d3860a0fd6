//! Configuration management for rtcbridge

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Registry and dispatch configuration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Engine defaults (ICE servers, UDP ports)
    #[serde(default)]
    pub engine: EngineConfig,

    /// Host transport configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Maximum number of live connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,

    /// First id handed to data channels opened by the remote peer
    #[serde(default = "default_remote_channel_id_base")]
    pub remote_channel_id_base: u32,

    /// Per-stream broadcast capacity for track-set events
    #[serde(default = "default_stream_event_capacity")]
    pub stream_event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            remote_channel_id_base: default_remote_channel_id_base(),
            stream_event_capacity: default_stream_event_capacity(),
        }
    }
}

/// One ICE server entry, in the browser's `RTCIceServer` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Accept `"urls": "stun:..."` as well as `"urls": [...]`
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// STUN server host (empty disables)
    #[serde(default = "default_stun_host")]
    pub stun_host: String,

    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN server host (empty disables)
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// Use `turns:` instead of `turn:`
    #[serde(default)]
    pub turn_tls: bool,

    /// TURN transport ("udp" or "tcp")
    #[serde(default)]
    pub turn_protocol: String,

    /// Explicit ICE servers, used when no STUN/TURN host is configured
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Restrict ICE host candidates to this UDP port range
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stun_host: default_stun_host(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_username: String::new(),
            turn_password: String::new(),
            turn_tls: false,
            turn_protocol: String::new(),
            ice_servers: Vec::new(),
            ephemeral_udp_port_range: None,
        }
    }
}

impl EngineConfig {
    /// Default ICE servers for sessions whose `pcConfig` names none
    pub fn default_ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = Vec::new();

        if !self.stun_host.is_empty() && self.stun_port != 0 {
            servers.push(IceServerConfig {
                urls: vec![format!("stun:{}:{}", self.stun_host, self.stun_port)],
                username: None,
                credential: None,
            });
        }

        if !self.turn_host.is_empty() {
            let scheme = if self.turn_tls { "turns" } else { "turn" };
            let transport = if self.turn_protocol.is_empty() {
                "udp"
            } else {
                self.turn_protocol.as_str()
            };
            let (username, credential) = if !self.turn_username.is_empty() && !self.turn_password.is_empty() {
                (Some(self.turn_username.clone()), Some(self.turn_password.clone()))
            } else {
                (None, None)
            };
            servers.push(IceServerConfig {
                urls: vec![format!("{}:{}:{}?transport={}", scheme, self.turn_host, self.turn_port, transport)],
                username,
                credential,
            });
        }

        if servers.is_empty() {
            return self.ice_servers.clone();
        }
        servers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// WebSocket bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.bridge.stream_event_capacity == 0 {
            return Err("Bridge stream_event_capacity must be non-zero".into());
        }

        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        if !self.engine.turn_host.is_empty() && self.engine.turn_port == 0 {
            return Err("Engine turn_port must be non-zero when turn_host is set".into());
        }

        let protocol = self.engine.turn_protocol.as_str();
        if !protocol.is_empty() && protocol != "udp" && protocol != "tcp" {
            return Err("Engine turn_protocol must be \"udp\" or \"tcp\"".into());
        }

        if let Some([low, high]) = self.engine.ephemeral_udp_port_range {
            if low == 0 || low > high {
                return Err("Engine ephemeral_udp_port_range must be [low, high] with 0 < low <= high".into());
            }
        }

        for server in &self.engine.ice_servers {
            if server.urls.is_empty() {
                return Err("Engine ice_servers entries need at least one url".into());
            }
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" | "off" => {}
            _ => return Err(format!("Unknown log level \"{}\"", self.logging.level).into()),
        }

        Ok(())
    }
}

fn default_remote_channel_id_base() -> u32 {
    10_000
}

fn default_stream_event_capacity() -> usize {
    64
}

fn default_stun_host() -> String {
    "stun.l.google.com".to_string()
}

fn default_stun_port() -> u16 {
    19302
}

fn default_turn_port() -> u16 {
    3478
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_log_level() -> String {
    "info".to_string()
}
