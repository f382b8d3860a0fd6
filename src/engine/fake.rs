//! Scripted in-memory engine for tests
//!
//! Every session call is journalled as `"<session>:<operation>"` when it
//! starts, optionally after an injected delay. Applying a local description
//! raises the matching signaling state change from inside the call, as real
//! engines do. Other engine-side events can be pushed by hand through the
//! senders the bridge handed over.

use super::*;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;
type Delays = Arc<Mutex<HashMap<String, Duration>>>;

#[derive(Default)]
pub struct FakeEngine {
    journal: Journal,
    delays: Delays,
    sessions: Mutex<Vec<(Arc<FakeSession>, mpsc::UnboundedSender<SessionEvent>)>>,
    captures: AtomicU32,
    fail_capture: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Delay every later call of `operation` on every session
    pub fn delay(&self, operation: &str, delay: Duration) {
        self.delays.lock().insert(operation.to_string(), delay);
    }

    pub fn fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Session created by the n-th `new_session` call, counting from 1
    pub fn session(&self, n: usize) -> Arc<FakeSession> {
        self.sessions.lock()[n - 1].0.clone()
    }

    /// Event sender of the n-th session, counting from 1
    pub fn session_events(&self, n: usize) -> mpsc::UnboundedSender<SessionEvent> {
        self.sessions.lock()[n - 1].1.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn new_session(
        &self,
        _config: &PeerConnectionConfig,
        _constraints: Option<&serde_json::Value>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let mut sessions = self.sessions.lock();
        let session = Arc::new(FakeSession {
            tag: sessions.len() + 1,
            journal: self.journal.clone(),
            delays: self.delays.clone(),
            events: Some(events.clone()),
            ..FakeSession::default()
        });
        sessions.push((session.clone(), events));
        Ok(session as Arc<dyn EngineSession>)
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<Arc<dyn EngineStream>, EngineError> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(EngineError::Failure("Permission denied".to_string()));
        }
        if !constraints.audio.requested() && !constraints.video.requested() {
            return Err(EngineError::Failure("constraints request neither audio nor video".to_string()));
        }

        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = FakeStream::new(&format!("local-stream-{}", n));
        if constraints.audio.requested() {
            stream.add_track(&(FakeTrack::new(&format!("local-audio-{}", n), TrackKind::Audio) as Arc<dyn EngineTrack>));
        }
        if constraints.video.requested() {
            stream.add_track(&(FakeTrack::new(&format!("local-video-{}", n), TrackKind::Video) as Arc<dyn EngineTrack>));
        }
        Ok(stream as Arc<dyn EngineStream>)
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        Ok(vec![
            DeviceInfo {
                device_id: "mic-0".to_string(),
                kind: DeviceKind::AudioInput,
                label: "Fake microphone".to_string(),
                group_id: String::new(),
            },
            DeviceInfo {
                device_id: "cam-0".to_string(),
                kind: DeviceKind::VideoInput,
                label: "Fake camera".to_string(),
                group_id: String::new(),
            },
        ])
    }

    fn select_audio_output(&self, output: AudioOutput) -> Result<(), EngineError> {
        self.journal.lock().push(format!("engine:select_audio_output:{:?}", output));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSession {
    tag: usize,
    journal: Journal,
    delays: Delays,
    has_remote: AtomicBool,
    closed: AtomicBool,
    offers: AtomicU32,
    streams: Mutex<Vec<String>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl FakeSession {
    /// Standalone session with its own journal
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<String> {
        self.streams.lock().clone()
    }

    fn raise(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn enter(&self, operation: &str) -> Result<(), EngineError> {
        self.journal.lock().push(format!("{}:{}", self.tag, operation));
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(EngineError::InvalidState("session is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineSession for FakeSession {
    async fn create_offer(&self, _options: &OfferOptions) -> Result<SessionDescription, EngineError> {
        self.enter("create_offer").await?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0\r\no=- {} {} IN IP4 127.0.0.1\r\n", self.tag, n)))
    }

    async fn create_answer(&self, _options: &AnswerOptions) -> Result<SessionDescription, EngineError> {
        self.enter("create_answer").await?;
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidState(
                "CreateAnswer can't be called before SetRemoteDescription".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\n", self.tag)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.enter("set_local_description").await?;
        let signaling_state = match desc.sdp_type {
            SdpType::Offer => "have-local-offer",
            SdpType::Pranswer => "have-local-pranswer",
            SdpType::Answer | SdpType::Rollback => "stable",
        };
        self.raise(SessionEvent::SignalingStateChange(signaling_state.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.enter("set_remote_description").await?;
        if desc.sdp.is_empty() {
            return Err(EngineError::Failure("SessionDescription is empty".to_string()));
        }
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
        self.enter("add_ice_candidate").await
    }

    async fn add_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError> {
        self.enter("add_stream").await?;
        self.streams.lock().push(stream.id());
        Ok(())
    }

    async fn remove_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError> {
        self.enter("remove_stream").await?;
        let id = stream.id();
        self.streams.lock().retain(|s| *s != id);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn EngineDataChannel>, EngineError> {
        self.enter("create_data_channel").await?;
        Ok(FakeDataChannel::new(label, init.clone()) as Arc<dyn EngineDataChannel>)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.journal.lock().push(format!("{}:close", self.tag));
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeDataChannel {
    label: String,
    init: DataChannelInit,
    state: Mutex<DataChannelState>,
    events: Mutex<Option<mpsc::UnboundedSender<DataChannelEvent>>>,
    sent: Mutex<Vec<ChannelPayload>>,
    buffered: AtomicUsize,
}

impl FakeDataChannel {
    pub fn new(label: &str, init: DataChannelInit) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            init,
            state: Mutex::new(DataChannelState::Connecting),
            events: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
        })
    }

    fn raise(&self, event: DataChannelEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn transition(&self, state: DataChannelState) {
        *self.state.lock() = state;
        self.raise(DataChannelEvent::StateChange { ready_state: state });
    }

    pub fn open(&self) {
        self.transition(DataChannelState::Open);
    }

    /// Simulate the remote side closing the channel
    pub fn remote_close(&self) {
        self.transition(DataChannelState::Closed);
    }

    /// Simulate a message from the remote peer
    pub fn receive(&self, payload: ChannelPayload) {
        match payload {
            ChannelPayload::Text(message) => self.raise(DataChannelEvent::Message { message }),
            ChannelPayload::Binary(data) => self.raise(DataChannelEvent::BinaryMessage(data)),
        }
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EngineDataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn init(&self) -> DataChannelInit {
        self.init.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn observe(&self, events: mpsc::UnboundedSender<DataChannelEvent>) {
        *self.events.lock() = Some(events);
    }

    async fn send(&self, payload: ChannelPayload) -> Result<usize, EngineError> {
        if self.ready_state() != DataChannelState::Open {
            return Err(EngineError::InvalidState("DataChannel is not opened".to_string()));
        }
        let buffered = self.buffered.fetch_add(payload.len(), Ordering::SeqCst) + payload.len();
        self.sent.lock().push(payload);
        Ok(buffered)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.transition(DataChannelState::Closed);
        Ok(())
    }
}

pub struct FakeStream {
    id: String,
    audio: Mutex<Vec<Arc<dyn EngineTrack>>>,
    video: Mutex<Vec<Arc<dyn EngineTrack>>>,
    events: Mutex<Option<mpsc::UnboundedSender<StreamSignal>>>,
}

impl FakeStream {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            audio: Mutex::new(Vec::new()),
            video: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }

    fn set(&self, kind: TrackKind) -> &Mutex<Vec<Arc<dyn EngineTrack>>> {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Simulate the engine adding a track (e.g. a remote track arriving)
    pub fn inject_track(&self, track: Arc<FakeTrack>) {
        let track: Arc<dyn EngineTrack> = track;
        if self.add_track(&track) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(StreamSignal::TrackAdded(track));
            }
        }
    }

    /// Simulate the engine dropping a track
    pub fn eject_track(&self, track_id: &str) {
        if self.remove_track(track_id) {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(StreamSignal::TrackRemoved(track_id.to_string()));
            }
        }
    }
}

impl EngineStream for FakeStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        self.audio.lock().clone()
    }

    fn video_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        self.video.lock().clone()
    }

    fn add_track(&self, track: &Arc<dyn EngineTrack>) -> bool {
        let mut set = self.set(track.kind()).lock();
        if set.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        set.push(track.clone());
        true
    }

    fn remove_track(&self, track_id: &str) -> bool {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let mut set = self.set(kind).lock();
            if let Some(idx) = set.iter().position(|t| t.id() == track_id) {
                set.remove(idx);
                return true;
            }
        }
        false
    }

    fn observe(&self, events: mpsc::UnboundedSender<StreamSignal>) {
        *self.events.lock() = Some(events);
    }
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TrackSignal>>>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Simulate the source ending on the engine side
    pub fn end(&self) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(TrackSignal::Ended);
        }
    }
}

impl EngineTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> String {
        format!("fake {} {}", self.kind.as_str(), self.id)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn observe(&self, events: mpsc::UnboundedSender<TrackSignal>) {
        *self.events.lock() = Some(events);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Payload helper for binary sends in tests
pub fn binary(data: &'static [u8]) -> ChannelPayload {
    ChannelPayload::Binary(Bytes::from_static(data))
}
