//! Media engine interface
//!
//! The engine (session negotiation, ICE/DTLS, codecs, capture) is an external
//! collaborator. The bridge only talks to it through the traits below:
//! - `Engine`: process-wide factory for sessions and captured streams
//! - `EngineSession`: one peer session
//! - `EngineDataChannel`, `EngineStream`, `EngineTrack`: engine handles
//!
//! Engine-originated events are pushed into `mpsc` senders handed over by the
//! bridge, so no engine object keeps a bridge object alive.

pub mod types;

#[cfg(feature = "webrtc-engine")]
pub mod webrtc_rs;

#[cfg(test)]
pub mod fake;

pub use types::*;

use crate::bridge::events::DataChannelEvent;
use async_trait::async_trait;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Failure reported by the engine. The reason is surfaced to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation not valid in the current session/channel phase
    InvalidState(String),
    /// Media, negotiation or transport failure
    Failure(String),
    /// Engine does not implement the requested capability
    Unsupported(String),
}

impl EngineError {
    pub fn reason(&self) -> &str {
        match self {
            EngineError::InvalidState(reason)
            | EngineError::Failure(reason)
            | EngineError::Unsupported(reason) => reason,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl Error for EngineError {}

/// Events raised by an engine session
pub enum SessionEvent {
    SignalingStateChange(String),
    IceGatheringStateChange(String),
    /// `None` marks the end of candidate gathering
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChange(String),
    ConnectionStateChange(ConnectionState),
    NegotiationNeeded,
    AddStream(Arc<dyn EngineStream>),
    RemoveStream(String),
    /// Channel opened by the remote peer
    DataChannel(Arc<dyn EngineDataChannel>),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::SignalingStateChange(s) => write!(f, "SignalingStateChange({})", s),
            SessionEvent::IceGatheringStateChange(s) => write!(f, "IceGatheringStateChange({})", s),
            SessionEvent::IceCandidate(c) => write!(f, "IceCandidate({:?})", c),
            SessionEvent::IceConnectionStateChange(s) => write!(f, "IceConnectionStateChange({})", s),
            SessionEvent::ConnectionStateChange(s) => write!(f, "ConnectionStateChange({:?})", s),
            SessionEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            SessionEvent::AddStream(s) => write!(f, "AddStream({})", s.id()),
            SessionEvent::RemoveStream(id) => write!(f, "RemoveStream({})", id),
            SessionEvent::DataChannel(c) => write!(f, "DataChannel({})", c.label()),
        }
    }
}

/// Track-set changes raised by an engine stream
pub enum StreamSignal {
    TrackAdded(Arc<dyn EngineTrack>),
    TrackRemoved(String),
}

/// State changes raised by an engine track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSignal {
    Ended,
}

/// Process-wide engine factory
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a peer session. Session events are pushed into `events` until
    /// the session is closed and the sender dropped.
    async fn new_session(
        &self,
        config: &PeerConnectionConfig,
        constraints: Option<&serde_json::Value>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn EngineSession>, EngineError>;

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<Arc<dyn EngineStream>, EngineError>;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, EngineError>;

    fn select_audio_output(&self, output: AudioOutput) -> Result<(), EngineError> {
        Err(EngineError::Unsupported(format!(
            "audio output selection ({:?}) is not available",
            output
        )))
    }
}

/// One engine peer session. Not safe for concurrent mutation; the bridge
/// serialises every call per session.
#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self, options: &AnswerOptions) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply or buffer a candidate; the buffering policy is the engine's.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn add_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError>;

    async fn remove_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError>;

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn EngineDataChannel>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineDataChannel: Send + Sync {
    fn label(&self) -> String;

    /// Effective channel parameters
    fn init(&self) -> DataChannelInit;

    fn ready_state(&self) -> DataChannelState;

    /// Route channel events (state changes, messages) into `events`
    fn observe(&self, events: mpsc::UnboundedSender<DataChannelEvent>);

    /// Send a message, returning the channel's buffered amount afterwards
    async fn send(&self, payload: ChannelPayload) -> Result<usize, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

pub trait EngineStream: Send + Sync {
    fn id(&self) -> String;

    fn audio_tracks(&self) -> Vec<Arc<dyn EngineTrack>>;

    fn video_tracks(&self) -> Vec<Arc<dyn EngineTrack>>;

    /// Returns false if the track was already part of the stream
    fn add_track(&self, track: &Arc<dyn EngineTrack>) -> bool;

    /// Returns false if the track was not part of the stream
    fn remove_track(&self, track_id: &str) -> bool;

    fn observe(&self, events: mpsc::UnboundedSender<StreamSignal>);
}

pub trait EngineTrack: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn label(&self) -> String;

    fn set_enabled(&self, enabled: bool);

    fn stop(&self);

    fn observe(&self, events: mpsc::UnboundedSender<TrackSignal>);

    /// Adapters downcast their own track types through this
    fn as_any(&self) -> &dyn Any;
}
