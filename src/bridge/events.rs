//! Host-facing events and subscriptions
//!
//! Kept-open callbacks are modelled as a `Listener`/`Subscription` pair over
//! an unbounded channel. Dropping the `Subscription` is the unsubscribe; the
//! producing side notices on its next `emit` and stops delivering.

use super::{StreamId, TrackId};
use crate::engine::{
    ConnectionState, DataChannelInfo, DataChannelState, IceCandidate, TrackKind, TrackState,
};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Consumer that takes events synchronously, in emit order
pub trait EventSink<E>: Send + Sync {
    /// Take one event. Returns false once the consumer is gone.
    fn deliver(&self, event: E) -> bool;
}

enum Target<E> {
    Channel(mpsc::UnboundedSender<E>),
    Sink(Arc<dyn EventSink<E>>),
}

/// Producing half of a kept-open callback
pub struct Listener<E> {
    target: Target<E>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        let target = match &self.target {
            Target::Channel(tx) => Target::Channel(tx.clone()),
            Target::Sink(sink) => Target::Sink(sink.clone()),
        };
        Self { target }
    }
}

impl<E> Listener<E> {
    pub fn channel() -> (Listener<E>, Subscription<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Listener { target: Target::Channel(tx) }, Subscription { rx })
    }

    /// Hand every event straight to `sink` on the emitting task. The sink is
    /// released when the last clone of the listener drops.
    pub fn sink(sink: Arc<dyn EventSink<E>>) -> Listener<E> {
        Listener { target: Target::Sink(sink) }
    }

    /// Deliver an event. Returns false once the subscriber is gone.
    pub fn emit(&self, event: E) -> bool {
        match &self.target {
            Target::Channel(tx) => tx.send(event).is_ok(),
            Target::Sink(sink) => sink.deliver(event),
        }
    }
}

/// Consuming half of a kept-open callback
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once every producer has finished
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next already-delivered event, if any
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
    pub label: String,
    pub enabled: bool,
    pub ready_state: TrackState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: StreamId,
    pub audio_tracks: Vec<TrackInfo>,
    pub video_tracks: Vec<TrackInfo>,
}

/// Events on a connection's kept-open listener
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ConnectionEvent {
    SignalingStateChange { signaling_state: String },
    IceGatheringStateChange { ice_gathering_state: String },
    IceCandidate { candidate: Option<IceCandidate> },
    IceConnectionStateChange { ice_connection_state: String },
    ConnectionStateChange { connection_state: ConnectionState },
    NegotiationNeeded,
    AddStream { stream: StreamInfo },
    RemoveStream { stream_id: StreamId },
    /// The remote peer opened a channel; attach a listener with its `dcId`
    DataChannel { channel: DataChannelInfo },
}

/// Events on a data channel's kept-open listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DataChannelEvent {
    StateChange { ready_state: DataChannelState },
    Message { message: String },
    /// Delivered on the binary callback path, never as JSON
    #[serde(skip)]
    BinaryMessage(Bytes),
    Error { reason: String },
}

/// Track-set changes of a stream, fanned out to every subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    AddTrack { track: TrackInfo },
    RemoveTrack { track_id: TrackId, kind: TrackKind },
    TrackEnded { track_id: TrackId },
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TrackEvent {
    StateChange { ready_state: TrackState },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RendererEvent {
    /// The rendered video track changed; `None` means nothing is rendered
    VideoTrackChanged {
        stream_id: Option<StreamId>,
        track_id: Option<TrackId>,
    },
}

/// Acknowledgement of a data channel send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub buffered_amount: usize,
}
