//! Object registry and dispatch core
//!
//! This module provides:
//! - Identifier registries for connections, streams, tracks and renderers
//! - One serial timeline per connection for mutating operations
//! - Connection, data channel, stream, track and renderer wrappers
//! - The `Orchestrator` that resolves ids and routes engine events

pub mod connection;
pub mod data_channel;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod renderer;
pub mod stream;
pub mod timeline;
pub mod track;

pub use connection::Connection;
pub use data_channel::DataChannel;
pub use events::{Listener, Subscription};
pub use orchestrator::{BridgeSnapshot, Orchestrator};
pub use registry::Registry;
pub use renderer::{HeadlessSurface, RenderParams, Renderer, Surface};
pub use stream::MediaStream;
pub use timeline::{Ack, Reply, Timeline};
pub use track::MediaStreamTrack;

use crate::engine::EngineError;
use std::error::Error;
use std::fmt;

/// Host-chosen id of a peer connection
pub type ConnectionId = u32;
/// Host-chosen (or bridge-allocated, for remote channels) id, unique per connection
pub type DataChannelId = u32;
/// Host-chosen id of a renderer
pub type RendererId = u32;
/// Globally unique stream id
pub type StreamId = String;
/// Globally unique track id
pub type TrackId = String;

/// Category of a registered entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Connection,
    DataChannel,
    Stream,
    Track,
    Renderer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Connection => "connection",
            EntityKind::DataChannel => "data channel",
            EntityKind::Stream => "stream",
            EntityKind::Track => "track",
            EntityKind::Renderer => "renderer",
        };
        f.write_str(name)
    }
}

/// Bridge-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Id absent from its registry
    NotFound { kind: EntityKind, id: String },
    /// Id already registered
    AlreadyExists { kind: EntityKind, id: String },
    /// Entity is in a phase that rejects the operation
    InvalidState(String),
    /// Engine failure, surfaced verbatim
    Engine(EngineError),
    /// Operation dropped before producing a result
    Interrupted,
}

impl BridgeError {
    pub fn not_found(kind: EntityKind, id: impl fmt::Display) -> Self {
        BridgeError::NotFound { kind, id: id.to_string() }
    }

    pub fn already_exists(kind: EntityKind, id: impl fmt::Display) -> Self {
        BridgeError::AlreadyExists { kind, id: id.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound { .. })
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NotFound { kind, id } => write!(f, "{} {} does not exist", kind, id),
            BridgeError::AlreadyExists { kind, id } => write!(f, "{} {} already exists", kind, id),
            BridgeError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            BridgeError::Engine(err) => write!(f, "{}", err),
            BridgeError::Interrupted => write!(f, "Operation interrupted before completion"),
        }
    }
}

impl Error for BridgeError {}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::Engine(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BridgeError::not_found(EntityKind::Connection, 7).to_string(),
            "connection 7 does not exist"
        );
        let engine = BridgeError::from(EngineError::Failure("ICE failed".to_string()));
        assert_eq!(engine.to_string(), "ICE failed");
        assert!(BridgeError::not_found(EntityKind::Track, "t").is_not_found());
    }
}
