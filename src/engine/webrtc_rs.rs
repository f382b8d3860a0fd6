//! Engine adapter over the `webrtc` crate
//!
//! Every session gets its own API instance built from the default codecs and
//! interceptors plus a `SettingEngine` carrying the configured UDP port range.
//! Local capture produces sample-fed tracks (`TrackLocalStaticSample`); the
//! host pushes media into them through `WebRtcTrack::write_sample`. Remote
//! tracks are grouped into streams by their stream id.

use super::*;
use crate::config::{EngineConfig, IceServerConfig};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn failure(context: &str, err: webrtc::Error) -> EngineError {
    match err {
        webrtc::Error::ErrConnectionClosed => EngineError::InvalidState(err.to_string()),
        _ => EngineError::Failure(format!("{}: {}", context, err)),
    }
}

/// Engine factory backed by webrtc-rs
pub struct WebRtcEngine {
    config: EngineConfig,
}

impl WebRtcEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    fn build_api(&self) -> Result<webrtc::api::API, EngineError> {
        let mut setting_engine = SettingEngine::default();
        if let Some([low, high]) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(low, high)
                .map_err(|e| EngineError::Failure(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| failure("Failed to register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| failure("Failed to register interceptors", e))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }

    fn rtc_configuration(&self, config: &PeerConnectionConfig) -> RTCConfiguration {
        let servers: Vec<IceServerConfig> = if config.ice_servers.is_empty() {
            self.config.default_ice_servers()
        } else {
            config.ice_servers.clone()
        };
        let ice_servers = servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_transport_policy: config
                .ice_transport_policy
                .as_deref()
                .map(RTCIceTransportPolicy::from)
                .unwrap_or_default(),
            bundle_policy: config
                .bundle_policy
                .as_deref()
                .map(RTCBundlePolicy::from)
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Engine for WebRtcEngine {
    async fn new_session(
        &self,
        config: &PeerConnectionConfig,
        constraints: Option<&serde_json::Value>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        if let Some(constraints) = constraints {
            debug!("Ignoring pcConstraints {}", constraints);
        }
        let api = self.build_api()?;
        let pc = api
            .new_peer_connection(self.rtc_configuration(config))
            .await
            .map_err(|e| failure("Failed to create peer connection", e))?;

        let session = Arc::new(WebRtcSession {
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
            remote_streams: Arc::new(Mutex::new(HashMap::new())),
        });
        session.wire_events(events);
        Ok(session as Arc<dyn EngineSession>)
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<Arc<dyn EngineStream>, EngineError> {
        if !constraints.audio.requested() && !constraints.video.requested() {
            return Err(EngineError::Failure(
                "getUserMedia needs at least one of audio or video".to_string(),
            ));
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let stream = WebRtcStream::new(stream_id.clone());
        if constraints.audio.requested() {
            let track = WebRtcTrack::local(&stream_id, TrackKind::Audio);
            stream.add_track(&(track as Arc<dyn EngineTrack>));
        }
        if constraints.video.requested() {
            let track = WebRtcTrack::local(&stream_id, TrackKind::Video);
            stream.add_track(&(track as Arc<dyn EngineTrack>));
        }
        info!("Created local stream {}", stream_id);
        Ok(stream as Arc<dyn EngineStream>)
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, EngineError> {
        // Sample-fed sources are the only inputs this engine has
        Ok(vec![
            DeviceInfo {
                device_id: "default".to_string(),
                kind: DeviceKind::AudioInput,
                label: "Sample-fed audio source".to_string(),
                group_id: String::new(),
            },
            DeviceInfo {
                device_id: "default".to_string(),
                kind: DeviceKind::VideoInput,
                label: "Sample-fed video source".to_string(),
                group_id: String::new(),
            },
        ])
    }
}

type RemoteStreams = Arc<Mutex<HashMap<String, Arc<WebRtcStream>>>>;

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    /// RTP senders per attached local stream
    senders: Mutex<HashMap<String, Vec<Arc<RTCRtpSender>>>>,
    remote_streams: RemoteStreams,
}

impl WebRtcSession {
    fn wire_events(&self, events: mpsc::UnboundedSender<SessionEvent>) {
        let tx = events.clone();
        self.pc.on_signaling_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::SignalingStateChange(state.to_string()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::IceGatheringStateChange(state.to_string()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            match candidate.map(|c| c.to_json()).transpose() {
                Ok(init) => {
                    let candidate = init.map(|init| IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    });
                    let _ = tx.send(SessionEvent::IceCandidate(candidate));
                }
                Err(e) => warn!("Dropping unserialisable ICE candidate: {}", e),
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_ice_connection_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::IceConnectionStateChange(state.to_string()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = tx.send(SessionEvent::ConnectionStateChange(connection_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(SessionEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!("Remote data channel {} announced", channel.label());
            let _ = tx.send(SessionEvent::DataChannel(WebRtcDataChannel::wrap(channel)));
            Box::pin(async {})
        }));

        let tx = events;
        let remote_streams = self.remote_streams.clone();
        self.pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _receiver, _transceiver| {
            accept_remote_track(&remote_streams, &tx, remote);
            Box::pin(async {})
        }));
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Group a remote track into its stream, announcing the stream on its first
/// track. The track ends when its RTP flow ends.
fn accept_remote_track(streams: &RemoteStreams, events: &mpsc::UnboundedSender<SessionEvent>, remote: Arc<TrackRemote>) {
    let stream_id = remote.stream_id();
    let track = WebRtcTrack::remote(remote.clone());
    let track_id = track.id();

    let (stream, is_new) = {
        let mut streams = streams.lock();
        match streams.get(&stream_id) {
            Some(stream) => (stream.clone(), false),
            None => {
                let stream = WebRtcStream::new(stream_id.clone());
                streams.insert(stream_id.clone(), stream.clone());
                (stream, true)
            }
        }
    };

    if is_new {
        stream.add_track(&(track.clone() as Arc<dyn EngineTrack>));
        let _ = events.send(SessionEvent::AddStream(stream.clone()));
    } else {
        stream.inject(track.clone());
    }
    debug!("Remote track {} joined stream {}", track_id, stream_id);

    let streams = streams.clone();
    let events = events.clone();
    tokio::spawn(async move {
        while remote.read_rtp().await.is_ok() {}
        debug!("Remote track {} ended", track_id);
        track.end();
        stream.eject(&track_id);
        if stream.is_empty() {
            streams.lock().remove(&stream_id);
            let _ = events.send(SessionEvent::RemoveStream(stream_id));
        }
    });
}

fn rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return serde_json::to_value(&desc)
                .and_then(serde_json::from_value)
                .map_err(|e| EngineError::Failure(format!("Invalid rollback description: {}", e)));
        }
    };
    parsed.map_err(|e| failure("Invalid session description", e))
}

fn bridge_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    };
    SessionDescription::new(sdp_type, desc.sdp)
}

#[async_trait]
impl EngineSession for WebRtcSession {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                voice_activity_detection: options.voice_activity_detection,
                ice_restart: options.ice_restart,
            }))
            .await
            .map_err(|e| failure("Failed to create offer", e))?;
        Ok(bridge_description(offer))
    }

    async fn create_answer(&self, options: &AnswerOptions) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(Some(RTCAnswerOptions {
                voice_activity_detection: options.voice_activity_detection,
            }))
            .await
            .map_err(|e| failure("Failed to create answer", e))?;
        Ok(bridge_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(rtc_description(desc)?)
            .await
            .map_err(|e| failure("Failed to set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(rtc_description(desc)?)
            .await
            .map_err(|e| failure("Failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| failure("Failed to add ICE candidate", e))
    }

    async fn add_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError> {
        let mut local = Vec::new();
        for track in stream.audio_tracks().into_iter().chain(stream.video_tracks()) {
            match track.as_any().downcast_ref::<WebRtcTrack>().and_then(WebRtcTrack::sample_track) {
                Some(sample) => local.push(sample),
                None => {
                    return Err(EngineError::Unsupported(format!(
                        "track {} is not a local track and cannot be sent",
                        track.id()
                    )))
                }
            }
        }

        let mut senders = Vec::with_capacity(local.len());
        for sample in local {
            let sender = self
                .pc
                .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| failure("Failed to add track", e))?;
            senders.push(sender);
        }
        self.senders.lock().entry(stream.id()).or_default().extend(senders);
        Ok(())
    }

    async fn remove_stream(&self, stream: &Arc<dyn EngineStream>) -> Result<(), EngineError> {
        let senders = self.senders.lock().remove(&stream.id()).unwrap_or_default();
        for sender in senders {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| failure("Failed to remove track", e))?;
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn EngineDataChannel>, EngineError> {
        let options = RTCDataChannelInit {
            ordered: init.ordered,
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: init.protocol.clone(),
            negotiated: if init.negotiated { init.id } else { None },
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(options))
            .await
            .map_err(|e| failure("Failed to create data channel", e))?;
        Ok(WebRtcDataChannel::wrap(channel))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.senders.lock().clear();
        self.remote_streams.lock().clear();
        self.pc.close().await.map_err(|e| failure("Failed to close connection", e))
    }
}

pub struct WebRtcDataChannel {
    rtc: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn wrap(rtc: Arc<RTCDataChannel>) -> Arc<dyn EngineDataChannel> {
        Arc::new(Self { rtc }) as Arc<dyn EngineDataChannel>
    }
}

fn channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        _ => DataChannelState::Connecting,
    }
}

#[async_trait]
impl EngineDataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.rtc.label().to_string()
    }

    fn init(&self) -> DataChannelInit {
        let negotiated = self.rtc.negotiated();
        DataChannelInit {
            ordered: Some(self.rtc.ordered()),
            max_packet_life_time: Some(self.rtc.max_packet_lifetime()),
            max_retransmits: Some(self.rtc.max_retransmits()),
            protocol: Some(self.rtc.protocol().to_string()),
            negotiated,
            id: negotiated.then(|| self.rtc.id()),
        }
    }

    fn ready_state(&self) -> DataChannelState {
        channel_state(self.rtc.ready_state())
    }

    fn observe(&self, events: mpsc::UnboundedSender<DataChannelEvent>) {
        // Remote channels are often already open by the time they are
        // observed. Sampled before `on_open` is installed so a channel that
        // opens in between is reported by the handler alone.
        let already_open = self.rtc.ready_state() == RTCDataChannelState::Open;

        let tx = events.clone();
        self.rtc.on_open(Box::new(move || {
            let _ = tx.send(DataChannelEvent::StateChange {
                ready_state: DataChannelState::Open,
            });
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.rtc.on_close(Box::new(move || {
            let _ = tx.send(DataChannelEvent::StateChange {
                ready_state: DataChannelState::Closed,
            });
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.rtc.on_message(Box::new(move |msg: DataChannelMessage| {
            let event = if msg.is_string {
                DataChannelEvent::Message {
                    message: String::from_utf8_lossy(&msg.data).into_owned(),
                }
            } else {
                DataChannelEvent::BinaryMessage(msg.data)
            };
            let _ = tx.send(event);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.rtc.on_error(Box::new(move |err| {
            let _ = tx.send(DataChannelEvent::Error { reason: err.to_string() });
            Box::pin(async {})
        }));

        if already_open {
            let _ = events.send(DataChannelEvent::StateChange {
                ready_state: DataChannelState::Open,
            });
        }
    }

    async fn send(&self, payload: ChannelPayload) -> Result<usize, EngineError> {
        let sent = match payload {
            ChannelPayload::Text(text) => self.rtc.send_text(text).await,
            ChannelPayload::Binary(data) => self.rtc.send(&data).await,
        };
        sent.map_err(|e| match e {
            webrtc::Error::ErrClosedPipe => EngineError::InvalidState("DataChannel is not opened".to_string()),
            e => failure("Failed to send", e),
        })?;
        Ok(self.rtc.buffered_amount().await)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.rtc.close().await.map_err(|e| failure("Failed to close data channel", e))
    }
}

pub struct WebRtcStream {
    id: String,
    tracks: Mutex<Vec<Arc<dyn EngineTrack>>>,
    events: Mutex<Option<mpsc::UnboundedSender<StreamSignal>>>,
}

impl WebRtcStream {
    fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            tracks: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }

    fn of_kind(&self, kind: TrackKind) -> Vec<Arc<dyn EngineTrack>> {
        self.tracks.lock().iter().filter(|t| t.kind() == kind).cloned().collect()
    }

    fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    fn signal(&self, signal: StreamSignal) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    fn inject(&self, track: Arc<WebRtcTrack>) {
        let track: Arc<dyn EngineTrack> = track;
        if self.add_track(&track) {
            self.signal(StreamSignal::TrackAdded(track));
        }
    }

    fn eject(&self, track_id: &str) {
        if self.remove_track(track_id) {
            self.signal(StreamSignal::TrackRemoved(track_id.to_string()));
        }
    }
}

impl EngineStream for WebRtcStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn audio_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        self.of_kind(TrackKind::Audio)
    }

    fn video_tracks(&self) -> Vec<Arc<dyn EngineTrack>> {
        self.of_kind(TrackKind::Video)
    }

    fn add_track(&self, track: &Arc<dyn EngineTrack>) -> bool {
        let mut tracks = self.tracks.lock();
        let id = track.id();
        if tracks.iter().any(|t| t.id() == id) {
            return false;
        }
        tracks.push(track.clone());
        true
    }

    fn remove_track(&self, track_id: &str) -> bool {
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|t| t.id() != track_id);
        tracks.len() != before
    }

    fn observe(&self, events: mpsc::UnboundedSender<StreamSignal>) {
        *self.events.lock() = Some(events);
    }
}

enum Source {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
}

pub struct WebRtcTrack {
    id: String,
    kind: TrackKind,
    source: Source,
    enabled: AtomicBool,
    stopped: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TrackSignal>>>,
}

impl WebRtcTrack {
    fn new(id: String, kind: TrackKind, source: Source) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            source,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }

    fn local(stream_id: &str, kind: TrackKind) -> Arc<Self> {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = format!("{}-{}", kind.as_str(), uuid::Uuid::new_v4());
        let sample = TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_string());
        Self::new(id, kind, Source::Local(Arc::new(sample)))
    }

    fn remote(remote: Arc<TrackRemote>) -> Arc<Self> {
        let kind = match remote.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self::new(remote.id(), kind, Source::Remote(remote))
    }

    fn sample_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        match &self.source {
            Source::Local(sample) => Some(sample.clone()),
            Source::Remote(_) => None,
        }
    }

    fn end(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(TrackSignal::Ended);
        }
    }

    /// Feed one media sample into a local track. Samples are dropped while
    /// the track is disabled and rejected once it is stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState(format!("track {} is ended", self.id)));
        }
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        match &self.source {
            Source::Local(track) => track
                .write_sample(sample)
                .await
                .map_err(|e| failure("Failed to write sample", e)),
            Source::Remote(_) => Err(EngineError::Unsupported(format!(
                "track {} is remote and cannot be fed",
                self.id
            ))),
        }
    }
}

impl EngineTrack for WebRtcTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> String {
        match &self.source {
            Source::Local(_) => format!("local {}", self.kind.as_str()),
            Source::Remote(remote) => format!("remote {} ({})", self.kind.as_str(), remote.stream_id()),
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // No Ended signal: the bridge initiated the stop
        self.events.lock().take();
    }

    fn observe(&self, events: mpsc::UnboundedSender<TrackSignal>) {
        *self.events.lock() = Some(events);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_engine() -> Arc<WebRtcEngine> {
        let config = EngineConfig {
            stun_host: String::new(),
            ..EngineConfig::default()
        };
        WebRtcEngine::new(config)
    }

    #[tokio::test]
    async fn test_offer_carries_data_channel() {
        let engine = offline_engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine
            .new_session(&PeerConnectionConfig::default(), None, tx)
            .await
            .unwrap();

        let channel = session
            .create_data_channel("chat", &DataChannelInit::default())
            .await
            .unwrap();
        assert_eq!(channel.label(), "chat");
        assert_eq!(channel.ready_state(), DataChannelState::Connecting);

        let offer = session.create_offer(&OfferOptions::default()).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_before_remote_description_fails() {
        let engine = offline_engine();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine
            .new_session(&PeerConnectionConfig::default(), None, tx)
            .await
            .unwrap();
        assert!(session.create_answer(&AnswerOptions::default()).await.is_err());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_builds_sample_tracks() {
        let engine = offline_engine();
        let constraints = MediaConstraints {
            audio: Constraint::Enabled(true),
            video: Constraint::Enabled(true),
        };
        let stream = engine.get_user_media(&constraints).await.unwrap();
        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 1);

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = engine
            .new_session(&PeerConnectionConfig::default(), None, tx)
            .await
            .unwrap();
        session.add_stream(&stream).await.unwrap();
        let offer = session.create_offer(&OfferOptions::default()).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        session.remove_stream(&stream).await.unwrap();
        session.close().await.unwrap();
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(connection_state(RTCPeerConnectionState::Connected), ConnectionState::Connected);
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
    }
}
