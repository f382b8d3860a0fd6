//! Orchestrator: the single entry point of the bridge
//!
//! The orchestrator owns the four global registries (connections, streams,
//! tracks, renderers) and the engine factory. Every call resolves its ids
//! against the registries before anything is scheduled:
//! - connection operations run on the connection's own timeline and resolve
//!   the connection id a second time when they execute
//! - stream and track mutations run on one shared media timeline
//! - renderer operations touch no engine session and run inline
//!
//! Remote streams and tracks discovered on a connection go through the same
//! save/delete routines as locally captured ones.

use super::connection::Connection;
use super::events::{
    ConnectionEvent, DataChannelEvent, Listener, RendererEvent, SendReceipt, StreamEvent, StreamInfo,
    Subscription, TrackEvent, TrackInfo,
};
use super::registry::Registry;
use super::renderer::{RenderParams, Renderer, Surface};
use super::stream::MediaStream;
use super::timeline::{Ack, Reply, Timeline};
use super::track::MediaStreamTrack;
use super::{BridgeError, ConnectionId, DataChannelId, EntityKind, RendererId, StreamId, TrackId};
use crate::config::BridgeConfig;
use crate::engine::{
    AnswerOptions, AudioOutput, ChannelPayload, ConnectionState, DataChannelInit, DeviceInfo, Engine,
    EngineStream, EngineTrack, IceCandidate, MediaConstraints, OfferOptions, PeerConnectionConfig,
    SessionDescription, SessionEvent, StreamSignal, TrackSignal,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};

/// Snapshot of every live id, for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub streams: Vec<StreamInfo>,
    pub tracks: Vec<TrackInfo>,
    pub renderers: Vec<RendererSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub closing: bool,
    pub data_channels: Vec<DataChannelId>,
    pub streams: Vec<StreamId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererSnapshot {
    pub id: RendererId,
    pub stream_id: Option<StreamId>,
    pub video_track_id: Option<TrackId>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    config: BridgeConfig,
    connections: Registry<ConnectionId, Connection>,
    streams: Registry<StreamId, MediaStream>,
    tracks: Registry<TrackId, MediaStreamTrack>,
    renderers: Registry<RendererId, Renderer>,
    /// Serial lane for stream and track mutations
    media: Timeline,
}

/// Cloneable handle to the bridge. Clones share the same registries.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator around an engine factory. Must be called inside
    /// a tokio runtime.
    pub fn new(engine: Arc<dyn Engine>, config: BridgeConfig) -> Self {
        info!(
            "Bridge starting (max_connections={}, remote channel ids from {})",
            config.max_connections, config.remote_channel_id_base
        );
        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                connections: Registry::new(EntityKind::Connection),
                streams: Registry::new(EntityKind::Stream),
                tracks: Registry::new(EntityKind::Track),
                renderers: Registry::new(EntityKind::Renderer),
                media: Timeline::spawn("media"),
            }),
        }
    }

    pub fn connection(&self, pc_id: ConnectionId) -> Result<Arc<Connection>, BridgeError> {
        self.inner.connections.lookup(&pc_id)
    }

    pub fn stream(&self, stream_id: &str) -> Result<Arc<MediaStream>, BridgeError> {
        self.inner.streams.lookup(stream_id)
    }

    pub fn track(&self, track_id: &str) -> Result<Arc<MediaStreamTrack>, BridgeError> {
        self.inner.tracks.lookup(track_id)
    }

    pub fn renderer(&self, renderer_id: RendererId) -> Result<Arc<Renderer>, BridgeError> {
        self.inner.renderers.lookup(&renderer_id)
    }

    // --- Connections -----------------------------------------------------

    /// Create a connection under `pc_id` and return its kept-open event
    /// subscription. The id is resolvable once this returns.
    pub async fn new_connection(
        &self,
        pc_id: ConnectionId,
        pc_config: Option<PeerConnectionConfig>,
        pc_constraints: Option<serde_json::Value>,
    ) -> Result<Subscription<ConnectionEvent>, BridgeError> {
        let (listener, subscription) = Listener::channel();
        self.new_connection_with_listener(pc_id, pc_config, pc_constraints, listener)
            .await?;
        Ok(subscription)
    }

    /// Create a connection under `pc_id` whose events go to `listener`.
    ///
    /// Events raised by the engine while a connection operation runs reach
    /// the listener before that operation's reply resolves.
    pub async fn new_connection_with_listener(
        &self,
        pc_id: ConnectionId,
        pc_config: Option<PeerConnectionConfig>,
        pc_constraints: Option<serde_json::Value>,
        listener: Listener<ConnectionEvent>,
    ) -> Result<(), BridgeError> {
        let inner = &self.inner;
        if inner.connections.contains(&pc_id) {
            return Err(BridgeError::already_exists(EntityKind::Connection, pc_id));
        }
        let limit = inner.config.max_connections;
        if limit > 0 && inner.connections.len() >= limit {
            return Err(BridgeError::InvalidState(format!("connection limit ({}) reached", limit)));
        }

        let pc_config = pc_config.unwrap_or_default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = inner
            .engine
            .new_session(&pc_config, pc_constraints.as_ref(), events_tx)
            .await?;

        let conn = Connection::new(pc_id, session, listener, inner.config.remote_channel_id_base);
        if !inner.connections.register(pc_id, conn.clone()) {
            // Lost a race against a concurrent new_connection with the same id
            if let Err(e) = conn.close().await {
                warn!("Connection {}: discarding duplicate session failed: {}", pc_id, e);
            }
            return Err(BridgeError::already_exists(EntityKind::Connection, pc_id));
        }

        inner.spawn_session_pump(&conn, events_rx);
        info!("Connection {} created ({} live)", pc_id, inner.connections.len());
        Ok(())
    }

    /// Resolve a connection that still accepts operations
    fn live_connection(&self, pc_id: ConnectionId) -> Result<Arc<Connection>, BridgeError> {
        let conn = self.inner.connections.lookup(&pc_id)?;
        if conn.is_closing() {
            return Err(BridgeError::InvalidState(format!("connection {} is closing", pc_id)));
        }
        Ok(conn)
    }

    /// Queue `job` on the connection's timeline. The id is checked now and
    /// resolved again when the job runs. The reply resolves only after the
    /// events the engine raised during the job have been emitted.
    fn on_connection<T, F, Fut>(&self, pc_id: ConnectionId, job: F) -> Reply<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Connection>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BridgeError>> + Send + 'static,
    {
        let conn = match self.live_connection(pc_id) {
            Ok(conn) => conn,
            Err(e) => return Reply::ready(Err(e)),
        };
        let inner = Arc::downgrade(&self.inner);
        conn.timeline().request(async move {
            let conn = inner
                .upgrade()
                .ok_or(BridgeError::Interrupted)?
                .connections
                .lookup(&pc_id)?;
            let result = job(conn.clone()).await;
            conn.settle_events().await;
            result
        })
    }

    pub fn create_offer(&self, pc_id: ConnectionId, options: OfferOptions) -> Reply<SessionDescription> {
        self.on_connection(pc_id, move |conn| async move { conn.create_offer(options).await })
    }

    pub fn create_answer(&self, pc_id: ConnectionId, options: AnswerOptions) -> Reply<SessionDescription> {
        self.on_connection(pc_id, move |conn| async move { conn.create_answer(options).await })
    }

    pub fn set_local_description(&self, pc_id: ConnectionId, desc: SessionDescription) -> Ack {
        self.on_connection(pc_id, move |conn| async move { conn.set_local_description(desc).await })
    }

    pub fn set_remote_description(&self, pc_id: ConnectionId, desc: SessionDescription) -> Ack {
        self.on_connection(pc_id, move |conn| async move { conn.set_remote_description(desc).await })
    }

    pub fn add_ice_candidate(&self, pc_id: ConnectionId, candidate: IceCandidate) -> Ack {
        self.on_connection(pc_id, move |conn| async move { conn.add_ice_candidate(candidate).await })
    }

    /// Attach a stream to the connection's outgoing media path. On success
    /// the stream is saved in the registry, a no-op while it is still
    /// registered. Streams only leave the registry through release, which
    /// this rejects.
    pub fn add_stream(&self, pc_id: ConnectionId, stream_id: &str) -> Ack {
        let stream = match self.inner.streams.lookup(stream_id) {
            Ok(stream) => stream,
            Err(e) => return Reply::ready(Err(e)),
        };
        let inner = Arc::downgrade(&self.inner);
        self.on_connection(pc_id, move |conn| async move {
            if stream.is_released() {
                return Err(BridgeError::not_found(EntityKind::Stream, stream.id()));
            }
            conn.add_stream(&stream).await?;
            if let Some(inner) = inner.upgrade() {
                if !stream.is_released() {
                    inner.save_media_stream(stream.engine().clone());
                }
            }
            Ok(())
        })
    }

    pub fn remove_stream(&self, pc_id: ConnectionId, stream_id: &str) -> Ack {
        let stream = match self.inner.streams.lookup(stream_id) {
            Ok(stream) => stream,
            Err(e) => return Reply::ready(Err(e)),
        };
        self.on_connection(pc_id, move |conn| async move { conn.remove_stream(&stream).await })
    }

    /// Create a data channel under `dc_id` and return its kept-open event
    /// subscription once the engine has created it.
    pub fn create_data_channel(
        &self,
        pc_id: ConnectionId,
        dc_id: DataChannelId,
        label: String,
        init: DataChannelInit,
    ) -> Reply<Subscription<DataChannelEvent>> {
        self.on_connection(pc_id, move |conn| async move {
            let (listener, subscription) = Listener::channel();
            conn.create_data_channel(dc_id, label, init, listener).await?;
            Ok(subscription)
        })
    }

    /// Attach a listener to a channel the remote peer opened
    pub fn set_data_channel_listener(
        &self,
        pc_id: ConnectionId,
        dc_id: DataChannelId,
    ) -> Reply<Subscription<DataChannelEvent>> {
        if let Err(e) = self.live_connection(pc_id).and_then(|conn| conn.channel(dc_id)) {
            return Reply::ready(Err(e));
        }
        self.on_connection(pc_id, move |conn| async move {
            let channel = conn.channel(dc_id)?;
            let (listener, subscription) = Listener::channel();
            channel.set_listener(listener);
            Ok(subscription)
        })
    }

    pub fn send_data(&self, pc_id: ConnectionId, dc_id: DataChannelId, payload: ChannelPayload) -> Reply<SendReceipt> {
        if let Err(e) = self.live_connection(pc_id).and_then(|conn| conn.channel(dc_id)) {
            return Reply::ready(Err(e));
        }
        self.on_connection(pc_id, move |conn| async move { conn.channel(dc_id)?.send(payload).await })
    }

    pub fn close_data_channel(&self, pc_id: ConnectionId, dc_id: DataChannelId) -> Ack {
        if let Err(e) = self.live_connection(pc_id).and_then(|conn| conn.channel(dc_id)) {
            return Reply::ready(Err(e));
        }
        self.on_connection(pc_id, move |conn| async move { conn.channel(dc_id)?.close().await })
    }

    /// Close the connection. Later calls with `pc_id` are rejected at once;
    /// calls already queued run first. The id leaves the registry as the
    /// last step.
    pub fn close_connection(&self, pc_id: ConnectionId) -> Ack {
        let conn = match self.inner.connections.lookup(&pc_id) {
            Ok(conn) => conn,
            Err(e) => return Reply::ready(Err(e)),
        };
        if !conn.begin_close() {
            debug!("Connection {} already closing", pc_id);
            return Reply::ready(Ok(()));
        }

        let inner = Arc::downgrade(&self.inner);
        conn.timeline().request(async move {
            let inner = inner.upgrade().ok_or(BridgeError::Interrupted)?;
            let conn = inner.connections.lookup(&pc_id)?;
            let result = conn.close().await;
            conn.settle_events().await;
            inner.connections.remove(&pc_id);
            info!("Connection {} removed ({} live)", pc_id, inner.connections.len());
            result
        })
    }

    // --- Streams and tracks -----------------------------------------------

    /// Queue a stream/track mutation on the media timeline
    fn on_media<T, F>(&self, job: F) -> Reply<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Inner>) -> Result<T, BridgeError> + Send + 'static,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.media.request(async move {
            let inner = inner.upgrade().ok_or(BridgeError::Interrupted)?;
            job(&inner)
        })
    }

    /// Subscribe to track-set changes of a stream
    pub fn set_stream_listener(&self, stream_id: &str) -> Result<Subscription<StreamEvent>, BridgeError> {
        let stream = self.inner.streams.lookup(stream_id)?;
        let (listener, subscription) = Listener::channel();
        let mut events = stream.subscribe();
        let stream_id = stream.id().to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let released = matches!(event, StreamEvent::Released);
                        if !listener.emit(event) || released {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Stream {} listener lagged, {} events dropped", stream_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Stream {} listener finished", stream_id);
        });
        Ok(subscription)
    }

    pub fn stream_add_track(&self, stream_id: &str, track_id: &str) -> Ack {
        if let Err(e) = self.stream(stream_id).and_then(|_| self.track(track_id)) {
            return Reply::ready(Err(e));
        }
        let (stream_id, track_id) = (stream_id.to_string(), track_id.to_string());
        self.on_media(move |inner| {
            let stream = inner.streams.lookup(&stream_id)?;
            let track = inner.tracks.lookup(&track_id)?;
            if !stream.add_track(track) {
                debug!("Stream {} already holds track {}", stream_id, track_id);
            }
            Ok(())
        })
    }

    /// Removing a track the stream does not hold is a no-op
    pub fn stream_remove_track(&self, stream_id: &str, track_id: &str) -> Ack {
        if let Err(e) = self.stream(stream_id) {
            return Reply::ready(Err(e));
        }
        let (stream_id, track_id) = (stream_id.to_string(), track_id.to_string());
        self.on_media(move |inner| {
            let stream = inner.streams.lookup(&stream_id)?;
            if stream.remove_track(&track_id).is_none() {
                debug!("Stream {} does not hold track {}", stream_id, track_id);
            }
            Ok(())
        })
    }

    /// Drop the stream from the registry. Its tracks stay registered.
    pub fn release_stream(&self, stream_id: &str) -> Result<(), BridgeError> {
        self.inner.streams.lookup(stream_id)?;
        self.inner.delete_media_stream(stream_id);
        Ok(())
    }

    /// Subscribe to a track's state. The subscription ends after "ended".
    pub fn set_track_listener(&self, track_id: &str) -> Result<Subscription<TrackEvent>, BridgeError> {
        let track = self.inner.tracks.lookup(track_id)?;
        let (listener, subscription) = Listener::channel();
        track.add_listener(listener);
        Ok(subscription)
    }

    pub fn set_track_enabled(&self, track_id: &str, enabled: bool) -> Ack {
        if let Err(e) = self.track(track_id) {
            return Reply::ready(Err(e));
        }
        let track_id = track_id.to_string();
        self.on_media(move |inner| {
            inner.tracks.lookup(&track_id)?.set_enabled(enabled);
            Ok(())
        })
    }

    /// Halt the track, notify every stream holding it and unregister it
    pub fn stop_track(&self, track_id: &str) -> Ack {
        if let Err(e) = self.track(track_id) {
            return Reply::ready(Err(e));
        }
        let track_id = track_id.to_string();
        self.on_media(move |inner| {
            let track = inner.tracks.lookup(&track_id)?;
            inner.end_track(&track, true);
            Ok(())
        })
    }

    // --- Renderers --------------------------------------------------------

    pub fn new_renderer(
        &self,
        renderer_id: RendererId,
        surface: Arc<dyn Surface>,
    ) -> Result<Subscription<RendererEvent>, BridgeError> {
        let (listener, subscription) = Listener::channel();
        let renderer = Renderer::new(renderer_id, surface, listener);
        if !self.inner.renderers.register(renderer_id, renderer) {
            return Err(BridgeError::already_exists(EntityKind::Renderer, renderer_id));
        }
        info!("Renderer {} created", renderer_id);
        Ok(subscription)
    }

    pub fn render(&self, renderer_id: RendererId, stream_id: &str) -> Result<(), BridgeError> {
        let renderer = self.inner.renderers.lookup(&renderer_id)?;
        let stream = self.inner.streams.lookup(stream_id)?;
        renderer.render(&stream)
    }

    pub fn media_stream_changed(&self, renderer_id: RendererId) -> Result<(), BridgeError> {
        self.inner.renderers.lookup(&renderer_id)?.media_stream_changed()
    }

    pub fn refresh_renderer(&self, renderer_id: RendererId, params: RenderParams) -> Result<(), BridgeError> {
        self.inner.renderers.lookup(&renderer_id)?.refresh(params)
    }

    pub fn close_renderer(&self, renderer_id: RendererId) -> Result<(), BridgeError> {
        let renderer = self
            .inner
            .renderers
            .remove(&renderer_id)
            .ok_or_else(|| BridgeError::not_found(EntityKind::Renderer, renderer_id))?;
        renderer.close();
        Ok(())
    }

    // --- Capture and devices ----------------------------------------------

    /// Capture a local stream; the stream and its tracks are registered
    /// before the reply resolves.
    pub fn get_user_media(&self, constraints: MediaConstraints) -> Reply<StreamInfo> {
        let (reply, responder) = Reply::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = match inner.engine.get_user_media(&constraints).await {
                Ok(engine_stream) => {
                    let stream = inner.save_media_stream(engine_stream);
                    info!("Captured stream {}", stream.id());
                    Ok(stream.info())
                }
                Err(e) => {
                    warn!("getUserMedia failed: {}", e);
                    Err(e.into())
                }
            };
            let _ = responder.send(result);
        });
        reply
    }

    pub fn enumerate_devices(&self) -> Reply<Vec<DeviceInfo>> {
        let (reply, responder) = Reply::channel();
        let engine = self.inner.engine.clone();
        tokio::spawn(async move {
            let _ = responder.send(engine.enumerate_devices().await.map_err(BridgeError::from));
        });
        reply
    }

    pub fn select_audio_output(&self, output: AudioOutput) -> Result<(), BridgeError> {
        self.inner.engine.select_audio_output(output)?;
        info!("Audio output set to {:?}", output);
        Ok(())
    }

    // --- Diagnostics and teardown -----------------------------------------

    pub fn dump(&self) -> BridgeSnapshot {
        let inner = &self.inner;

        let mut connections: Vec<_> = inner
            .connections
            .values()
            .iter()
            .map(|conn| ConnectionSnapshot {
                id: conn.id(),
                state: conn.state(),
                closing: conn.is_closing(),
                data_channels: conn.channel_ids(),
                streams: conn.attached_streams(),
            })
            .collect();
        connections.sort_by_key(|c| c.id);

        let mut streams: Vec<_> = inner.streams.values().iter().map(|s| s.info()).collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));

        let mut tracks: Vec<_> = inner.tracks.values().iter().map(|t| t.info()).collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));

        let mut renderers: Vec<_> = inner
            .renderers
            .values()
            .iter()
            .map(|r| RendererSnapshot {
                id: r.id(),
                stream_id: r.stream_id(),
                video_track_id: r.video_track_id(),
            })
            .collect();
        renderers.sort_by_key(|r| r.id);

        BridgeSnapshot {
            connections,
            streams,
            tracks,
            renderers,
        }
    }

    /// Host teardown: close every renderer. Connections and streams are left
    /// to their owners.
    pub fn shutdown(&self) {
        let renderers = self.inner.renderers.drain();
        let count = renderers.len();
        for (_, renderer) in renderers {
            renderer.close();
        }
        info!("Bridge shutdown: {} renderers closed", count);
    }
}

impl Inner {
    /// Register a stream and its tracks, first registration wins. Returns
    /// the registered stream.
    fn save_media_stream(self: &Arc<Self>, engine_stream: Arc<dyn EngineStream>) -> Arc<MediaStream> {
        let stream_id = engine_stream.id();
        if let Some(existing) = self.streams.peek(&stream_id) {
            return existing;
        }

        let stream = MediaStream::new(engine_stream.clone(), self.config.stream_event_capacity);
        for track in engine_stream.audio_tracks().into_iter().chain(engine_stream.video_tracks()) {
            stream.insert_track(self.save_track(track));
        }

        let (stream, inserted) = self.streams.register_or_get(stream_id, stream);
        if inserted {
            self.observe_stream(&stream);
            debug!("Stream {} registered", stream.id());
        }
        stream
    }

    fn delete_media_stream(&self, stream_id: &str) {
        if let Some(stream) = self.streams.remove(stream_id) {
            stream.release();
        }
    }

    /// Register a track, first registration wins. Returns the registered
    /// track.
    fn save_track(self: &Arc<Self>, engine_track: Arc<dyn EngineTrack>) -> Arc<MediaStreamTrack> {
        let track_id = engine_track.id();
        if let Some(existing) = self.tracks.peek(&track_id) {
            return existing;
        }

        let (track, inserted) = self
            .tracks
            .register_or_get(track_id, MediaStreamTrack::new(engine_track));
        if inserted {
            self.observe_track(&track);
            debug!("Track {} ({}) registered", track.id(), track.kind().as_str());
        }
        track
    }

    /// Mark a track ended, tell every stream holding it and unregister it
    fn end_track(&self, track: &Arc<MediaStreamTrack>, stop_engine: bool) {
        let first = if stop_engine { track.stop() } else { track.mark_ended() };
        if !first {
            return;
        }
        for stream in self.streams.values() {
            stream.notify_track_ended(track.id());
        }
        if let Some(registered) = self.tracks.peek(track.id()) {
            if Arc::ptr_eq(&registered, track) {
                self.tracks.remove(track.id());
            }
        }
    }

    /// Unregister a track the engine dropped, unless a live stream still
    /// holds it
    fn release_orphaned_track(&self, track_id: &str) {
        let referenced = self.streams.values().iter().any(|s| s.contains_track(track_id));
        if !referenced && self.tracks.remove(track_id).is_some() {
            debug!("Track {} unregistered (no stream holds it)", track_id);
        }
    }

    fn observe_track(self: &Arc<Self>, track: &Arc<MediaStreamTrack>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        track.engine().observe(tx);

        let inner = Arc::downgrade(self);
        let weak_track = Arc::downgrade(track);
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    TrackSignal::Ended => {
                        if let (Some(inner), Some(track)) = (inner.upgrade(), weak_track.upgrade()) {
                            debug!("Track {} ended by the engine", track.id());
                            inner.end_track(&track, false);
                        }
                        break;
                    }
                }
            }
        });
        track.set_observer(handle);
    }

    fn observe_stream(self: &Arc<Self>, stream: &Arc<MediaStream>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.engine().observe(tx);

        let inner = Arc::downgrade(self);
        let weak_stream = Arc::downgrade(stream);
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let (Some(inner), Some(stream)) = (inner.upgrade(), weak_stream.upgrade()) else {
                    break;
                };
                match signal {
                    StreamSignal::TrackAdded(engine_track) => {
                        // Registered before any listener hears of it
                        let track = inner.save_track(engine_track);
                        stream.insert_track(track);
                    }
                    StreamSignal::TrackRemoved(track_id) => {
                        stream.detach_track(&track_id);
                        inner.release_orphaned_track(&track_id);
                    }
                }
            }
        });
        stream.set_observer(handle);
    }

    fn spawn_session_pump(self: &Arc<Self>, conn: &Arc<Connection>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let weak_conn = Arc::downgrade(conn);
        let pc_id = conn.id();
        let mut flushes = conn.take_flush_requests();

        tokio::spawn(async move {
            loop {
                let (event, flush) = tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Some(event) => (Some(event), None),
                        None => break,
                    },
                    Some(done) = next_flush(&mut flushes) => (None, Some(done)),
                };
                let (Some(inner), Some(conn)) = (inner.upgrade(), weak_conn.upgrade()) else {
                    break;
                };
                if let Some(event) = event {
                    inner.handle_session_event(&conn, event);
                }
                if let Some(done) = flush {
                    // Everything raised before the barrier goes out first
                    while let Ok(event) = events.try_recv() {
                        inner.handle_session_event(&conn, event);
                    }
                    let _ = done.send(());
                }
            }
            debug!("Connection {}: engine event pump finished", pc_id);
        });
    }

    fn handle_session_event(self: &Arc<Self>, conn: &Arc<Connection>, event: SessionEvent) {
        let pc_id = conn.id();
        debug!("Connection {}: engine event {:?}", pc_id, event);
        let forwarded = match event {
            SessionEvent::SignalingStateChange(signaling_state) => {
                ConnectionEvent::SignalingStateChange { signaling_state }
            }
            SessionEvent::IceGatheringStateChange(ice_gathering_state) => {
                ConnectionEvent::IceGatheringStateChange { ice_gathering_state }
            }
            SessionEvent::IceCandidate(candidate) => ConnectionEvent::IceCandidate { candidate },
            SessionEvent::IceConnectionStateChange(ice_connection_state) => {
                ConnectionEvent::IceConnectionStateChange { ice_connection_state }
            }
            SessionEvent::ConnectionStateChange(connection_state) => {
                conn.set_state(connection_state);
                if connection_state == ConnectionState::Failed {
                    error!("Connection {} failed", pc_id);
                }
                ConnectionEvent::ConnectionStateChange { connection_state }
            }
            SessionEvent::NegotiationNeeded => ConnectionEvent::NegotiationNeeded,
            SessionEvent::AddStream(engine_stream) => {
                let stream = self.save_media_stream(engine_stream);
                ConnectionEvent::AddStream { stream: stream.info() }
            }
            SessionEvent::RemoveStream(stream_id) => {
                self.delete_media_stream(&stream_id);
                ConnectionEvent::RemoveStream { stream_id }
            }
            SessionEvent::DataChannel(engine_channel) => {
                // Announced by the connection itself
                conn.accept_remote_channel(engine_channel);
                return;
            }
        };
        conn.emit(forwarded);
    }
}

/// Next flush barrier, or never when the pump has none to serve
async fn next_flush(
    flushes: &mut Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>,
) -> Option<oneshot::Sender<()>> {
    match flushes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
