//! rtcbridge - identifier-addressed bridge to a WebRTC engine
//!
//! A host drives peer connections, data channels, media streams and
//! renderers by integer and string ids; engine events flow back through
//! kept-open subscriptions.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod transport;

// Re-exports
pub use bridge::{BridgeError, Orchestrator};
pub use config::{BridgeConfig, Config, EngineConfig};
pub use engine::{Engine, EngineError};
pub use transport::{Dispatcher, HostMessage, WebSocketHost};
