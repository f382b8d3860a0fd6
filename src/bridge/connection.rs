//! Peer connection wrapper
//!
//! A `Connection` owns one engine session, the data channels created on it
//! and its own serial timeline. The orchestrator resolves the connection id
//! and queues the async methods below on that timeline, so the engine
//! session is never mutated by two operations at once.

use super::data_channel::DataChannel;
use super::events::{ConnectionEvent, DataChannelEvent, Listener};
use super::registry::Registry;
use super::stream::MediaStream;
use super::timeline::Timeline;
use super::{BridgeError, ConnectionId, DataChannelId, EntityKind, StreamId};
use crate::engine::{
    AnswerOptions, ConnectionState, DataChannelInit, EngineDataChannel, EngineSession, IceCandidate,
    OfferOptions, SessionDescription,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub struct Connection {
    id: ConnectionId,
    session: Arc<dyn EngineSession>,
    timeline: Timeline,
    channels: Arc<Registry<DataChannelId, DataChannel>>,
    /// Streams attached to the outgoing media path
    streams: Mutex<Vec<StreamId>>,
    state: Mutex<ConnectionState>,
    /// Set when the orchestrator stops accepting calls for this id
    closing: AtomicBool,
    /// Set once the session itself is torn down
    closed: AtomicBool,
    listener: Listener<ConnectionEvent>,
    remote_channel_id_base: DataChannelId,
    /// Barriers queued behind the engine events already raised
    flush: mpsc::UnboundedSender<oneshot::Sender<()>>,
    /// Taken by the event pump when it starts
    flush_requests: Mutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        session: Arc<dyn EngineSession>,
        listener: Listener<ConnectionEvent>,
        remote_channel_id_base: DataChannelId,
    ) -> Arc<Self> {
        let (flush, flush_requests) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            session,
            timeline: Timeline::spawn(format!("connection-{}", id)),
            channels: Arc::new(Registry::new(EntityKind::DataChannel)),
            streams: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::New),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listener,
            remote_channel_id_base,
            flush,
            flush_requests: Mutex::new(Some(flush_requests)),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Flag the connection as closing. Returns false if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if !self.listener.emit(event) {
            debug!("Connection {}: listener gone, event dropped", self.id);
        }
    }

    pub(crate) fn take_flush_requests(&self) -> Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>> {
        self.flush_requests.lock().take()
    }

    /// Wait until the event pump has emitted every engine event raised so
    /// far. Returns at once when no pump is running.
    pub(crate) async fn settle_events(&self) {
        if self.flush_requests.lock().is_some() {
            return;
        }
        let (done, settled) = oneshot::channel();
        if self.flush.send(done).is_ok() {
            let _ = settled.await;
        }
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::InvalidState(format!("connection {} is closed", self.id)));
        }
        Ok(())
    }

    pub fn channel(&self, dc_id: DataChannelId) -> Result<Arc<DataChannel>, BridgeError> {
        self.channels.lookup(&dc_id)
    }

    pub fn channel_ids(&self) -> Vec<DataChannelId> {
        let mut ids = self.channels.ids();
        ids.sort_unstable();
        ids
    }

    pub fn attached_streams(&self) -> Vec<StreamId> {
        self.streams.lock().clone()
    }

    pub async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, BridgeError> {
        self.ensure_open()?;
        let desc = self.session.create_offer(&options).await?;
        debug!("Connection {}: created {}", self.id, desc.sdp_type);
        Ok(desc)
    }

    pub async fn create_answer(&self, options: AnswerOptions) -> Result<SessionDescription, BridgeError> {
        self.ensure_open()?;
        let desc = self.session.create_answer(&options).await?;
        debug!("Connection {}: created {}", self.id, desc.sdp_type);
        Ok(desc)
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let sdp_type = desc.sdp_type;
        self.session.set_local_description(desc).await?;
        debug!("Connection {}: local description ({}) applied", self.id, sdp_type);
        Ok(())
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let sdp_type = desc.sdp_type;
        self.session.set_remote_description(desc).await?;
        debug!("Connection {}: remote description ({}) applied", self.id, sdp_type);
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.session.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn add_stream(&self, stream: &Arc<MediaStream>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.session.add_stream(stream.engine()).await?;
        let mut streams = self.streams.lock();
        if !streams.iter().any(|id| id == stream.id()) {
            streams.push(stream.id().to_string());
        }
        info!("Connection {}: stream {} attached", self.id, stream.id());
        Ok(())
    }

    pub async fn remove_stream(&self, stream: &Arc<MediaStream>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.session.remove_stream(stream.engine()).await?;
        self.streams.lock().retain(|id| id != stream.id());
        info!("Connection {}: stream {} detached", self.id, stream.id());
        Ok(())
    }

    /// Create a channel under a host-chosen id scoped to this connection
    pub async fn create_data_channel(
        &self,
        dc_id: DataChannelId,
        label: String,
        init: DataChannelInit,
        listener: Listener<DataChannelEvent>,
    ) -> Result<Arc<DataChannel>, BridgeError> {
        self.ensure_open()?;
        if self.channels.contains(&dc_id) {
            return Err(BridgeError::already_exists(EntityKind::DataChannel, dc_id));
        }

        let engine = self.session.create_data_channel(&label, &init).await?;
        let channel = DataChannel::new(self.id, dc_id, engine, Some(listener));
        if !self.channels.register(dc_id, channel.clone()) {
            return Err(BridgeError::already_exists(EntityKind::DataChannel, dc_id));
        }
        channel.start(Arc::downgrade(&self.channels));
        info!("Connection {}: data channel {} ({}) created", self.id, dc_id, label);
        Ok(channel)
    }

    /// Adopt a channel opened by the remote peer under the first free id at
    /// or above the remote id base, and announce it to the host.
    pub(crate) fn accept_remote_channel(&self, engine: Arc<dyn EngineDataChannel>) -> Option<Arc<DataChannel>> {
        if self.is_closing() {
            warn!("Connection {}: remote data channel arrived while closing, ignored", self.id);
            return None;
        }

        let mut dc_id = self.remote_channel_id_base;
        let channel = loop {
            let candidate = DataChannel::new(self.id, dc_id, engine.clone(), None);
            if self.channels.register(dc_id, candidate.clone()) {
                break candidate;
            }
            dc_id = dc_id.checked_add(1)?;
        };
        channel.start(Arc::downgrade(&self.channels));

        info!("Connection {}: remote data channel {} ({}) accepted", self.id, dc_id, channel.label());
        self.emit(ConnectionEvent::DataChannel { channel: channel.info() });
        Some(channel)
    }

    /// Close every owned channel, then the engine session
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.closing.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        for (dc_id, channel) in self.channels.drain() {
            if let Err(e) = channel.close().await {
                warn!("Connection {}: closing data channel {} failed: {}", self.id, dc_id, e);
            }
        }
        self.streams.lock().clear();
        self.session.close().await?;
        self.set_state(ConnectionState::Closed);
        info!("Connection {} closed", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeDataChannel, FakeSession};

    #[tokio::test]
    async fn test_remote_channels_skip_taken_ids() {
        let (listener, mut events) = Listener::channel();
        let conn = Connection::new(4, FakeSession::new(), listener, 100);

        let (dc_listener, _dc_events) = Listener::channel();
        conn.create_data_channel(100, "local".into(), DataChannelInit::default(), dc_listener)
            .await
            .unwrap();

        let remote = FakeDataChannel::new("remote", DataChannelInit::default());
        let channel = conn.accept_remote_channel(remote).unwrap();
        assert_eq!(channel.id(), 101);
        match events.recv().await {
            Some(ConnectionEvent::DataChannel { channel }) => {
                assert_eq!(channel.dc_id, 101);
                assert_eq!(channel.label, "remote");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(conn.channel_ids(), vec![100, 101]);
    }

    #[tokio::test]
    async fn test_duplicate_channel_id_rejected() {
        let (listener, _events) = Listener::channel();
        let conn = Connection::new(5, FakeSession::new(), listener, 10000);
        let (a, _a_events) = Listener::channel();
        let (b, _b_events) = Listener::channel();
        conn.create_data_channel(1, "a".into(), DataChannelInit::default(), a).await.unwrap();
        let err = conn
            .create_data_channel(1, "b".into(), DataChannelInit::default(), b)
            .await
            .err()
            .unwrap();
        assert_eq!(err, BridgeError::already_exists(EntityKind::DataChannel, 1));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let (listener, _events) = Listener::channel();
        let conn = Connection::new(6, FakeSession::new(), listener, 10000);
        assert!(conn.begin_close());
        assert!(!conn.begin_close());
        // flagged but not yet torn down: queued work still runs
        assert!(conn.create_offer(OfferOptions::default()).await.is_ok());

        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        let err = conn.create_offer(OfferOptions::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState(_)));
    }
}
