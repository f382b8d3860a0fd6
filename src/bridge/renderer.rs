//! Stream renderers
//!
//! A renderer binds a host display surface to the video track of at most one
//! stream. It holds the stream weakly and watches its track-set broadcast so
//! the selection follows the stream without a rebind.
//!
//! Selection policy: the most recently added live video track, or nothing.

use super::events::{Listener, RendererEvent, StreamEvent};
use super::stream::MediaStream;
use super::{BridgeError, RendererId, StreamId, TrackId};
use crate::engine::EngineTrack;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Display-affecting parameters pushed by the host on `refresh`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderParams {
    pub element_left: f64,
    pub element_top: f64,
    pub element_width: f64,
    pub element_height: f64,
    pub visible: bool,
    pub opacity: f64,
    pub z_index: f64,
    pub mirrored: bool,
    /// "contain" or "cover"
    pub object_fit: String,
    pub clip: bool,
    pub border_radius: f64,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            element_left: 0.0,
            element_top: 0.0,
            element_width: 0.0,
            element_height: 0.0,
            visible: true,
            opacity: 1.0,
            z_index: 0.0,
            mirrored: false,
            object_fit: "contain".to_string(),
            clip: true,
            border_radius: 0.0,
        }
    }
}

/// Host display surface. Frame drawing itself is the surface's business.
pub trait Surface: Send + Sync {
    fn attach(&self, track: &Arc<dyn EngineTrack>);

    fn detach(&self);

    fn apply(&self, params: &RenderParams);
}

/// Surface that only records what it was asked to show
#[derive(Default)]
pub struct HeadlessSurface {
    attached: Mutex<Option<String>>,
    params: Mutex<RenderParams>,
}

impl HeadlessSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached_track(&self) -> Option<String> {
        self.attached.lock().clone()
    }

    pub fn params(&self) -> RenderParams {
        self.params.lock().clone()
    }
}

impl Surface for HeadlessSurface {
    fn attach(&self, track: &Arc<dyn EngineTrack>) {
        *self.attached.lock() = Some(track.id());
    }

    fn detach(&self) {
        *self.attached.lock() = None;
    }

    fn apply(&self, params: &RenderParams) {
        *self.params.lock() = params.clone();
    }
}

#[derive(Default)]
struct Binding {
    stream: Option<Weak<MediaStream>>,
    stream_id: Option<StreamId>,
    track_id: Option<TrackId>,
    watcher: Option<JoinHandle<()>>,
}

impl Binding {
    fn unwatch(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

pub struct Renderer {
    id: RendererId,
    surface: Arc<dyn Surface>,
    listener: Listener<RendererEvent>,
    binding: Mutex<Binding>,
    params: Mutex<RenderParams>,
    closed: AtomicBool,
}

impl Renderer {
    pub fn new(id: RendererId, surface: Arc<dyn Surface>, listener: Listener<RendererEvent>) -> Arc<Self> {
        Arc::new(Self {
            id,
            surface,
            listener,
            binding: Mutex::new(Binding::default()),
            params: Mutex::new(RenderParams::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> RendererId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::InvalidState(format!("renderer {} is closed", self.id)));
        }
        Ok(())
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.binding.lock().stream_id.clone()
    }

    pub fn video_track_id(&self) -> Option<TrackId> {
        self.binding.lock().track_id.clone()
    }

    pub fn params(&self) -> RenderParams {
        self.params.lock().clone()
    }

    /// Bind to `stream`, dropping any previous binding
    pub fn render(self: &Arc<Self>, stream: &Arc<MediaStream>) -> Result<(), BridgeError> {
        self.ensure_open()?;
        {
            let mut binding = self.binding.lock();
            binding.unwatch();

            let mut events = stream.subscribe();
            let weak = Arc::downgrade(self);
            let watcher = tokio::spawn(async move {
                loop {
                    let released = match events.recv().await {
                        Ok(StreamEvent::Released) | Err(RecvError::Closed) => true,
                        Ok(_) => false,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Renderer watcher lagged by {} stream events", skipped);
                            false
                        }
                    };
                    let Some(renderer) = weak.upgrade() else {
                        break;
                    };
                    if released {
                        renderer.unbind();
                        break;
                    }
                    renderer.select();
                }
            });

            binding.stream = Some(Arc::downgrade(stream));
            binding.stream_id = Some(stream.id().to_string());
            binding.watcher = Some(watcher);
        }
        info!("Renderer {} bound to stream {}", self.id, stream.id());
        self.select();
        Ok(())
    }

    /// Re-evaluate the selected video track of the bound stream
    pub fn media_stream_changed(&self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.select();
        Ok(())
    }

    /// Apply display parameters without touching the binding
    pub fn refresh(&self, params: RenderParams) -> Result<(), BridgeError> {
        self.ensure_open()?;
        self.surface.apply(&params);
        debug!(
            "Renderer {} refreshed: {}x{} at ({}, {}) visible={}",
            self.id, params.element_width, params.element_height, params.element_left, params.element_top, params.visible
        );
        *self.params.lock() = params;
        Ok(())
    }

    /// Unsubscribe and release the surface. Returns false if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let had_track = {
            let mut binding = self.binding.lock();
            binding.unwatch();
            let had_track = binding.track_id.is_some();
            *binding = Binding::default();
            had_track
        };
        if had_track {
            self.surface.detach();
        }
        info!("Renderer {} closed", self.id);
        true
    }

    /// The bound stream went away
    fn unbind(&self) {
        {
            let mut binding = self.binding.lock();
            binding.stream = None;
            binding.stream_id = None;
            binding.watcher = None;
        }
        warn!("Renderer {}: bound stream released", self.id);
        self.select();
    }

    fn select(&self) {
        if self.is_closed() {
            return;
        }
        let mut binding = self.binding.lock();
        let next = binding
            .stream
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|stream| !stream.is_released())
            .and_then(|stream| stream.current_video_track());
        let next_id = next.as_ref().map(|track| track.id().to_string());
        if next_id == binding.track_id {
            return;
        }

        match &next {
            Some(track) => self.surface.attach(track.engine()),
            None => self.surface.detach(),
        }
        debug!("Renderer {}: video track {:?} -> {:?}", self.id, binding.track_id, next_id);
        binding.track_id = next_id.clone();
        self.listener.emit(RendererEvent::VideoTrackChanged {
            stream_id: binding.stream_id.clone(),
            track_id: next_id,
        });
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.binding.get_mut().unwatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::Subscription;
    use crate::bridge::track::MediaStreamTrack;
    use crate::engine::fake::{FakeStream, FakeTrack};
    use crate::engine::TrackKind;
    use std::time::Duration;

    fn renderer() -> (Arc<Renderer>, Arc<HeadlessSurface>, Subscription<RendererEvent>) {
        let surface = HeadlessSurface::new();
        let (listener, events) = Listener::channel();
        (Renderer::new(1, surface.clone(), listener), surface, events)
    }

    fn video(id: &str) -> Arc<MediaStreamTrack> {
        MediaStreamTrack::new(FakeTrack::new(id, TrackKind::Video))
    }

    async fn next_track(events: &mut Subscription<RendererEvent>) -> Option<TrackId> {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("renderer event")
            .expect("renderer listener open");
        match event {
            RendererEvent::VideoTrackChanged { track_id, .. } => track_id,
        }
    }

    #[tokio::test]
    async fn test_follows_most_recent_video_track() {
        let (renderer, surface, mut events) = renderer();
        let stream = MediaStream::new(FakeStream::new("s1"), 16);
        stream.insert_track(video("v1"));

        renderer.render(&stream).unwrap();
        assert_eq!(next_track(&mut events).await.as_deref(), Some("v1"));

        let newer = video("v2");
        stream.add_track(newer.clone());
        assert_eq!(next_track(&mut events).await.as_deref(), Some("v2"));
        assert_eq!(surface.attached_track().as_deref(), Some("v2"));

        newer.stop();
        stream.notify_track_ended("v2");
        assert_eq!(next_track(&mut events).await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_rebind_drops_previous_stream() {
        let (renderer, surface, mut events) = renderer();
        let first = MediaStream::new(FakeStream::new("s1"), 16);
        let second = MediaStream::new(FakeStream::new("s2"), 16);
        first.insert_track(video("v1"));

        renderer.render(&first).unwrap();
        assert_eq!(next_track(&mut events).await.as_deref(), Some("v1"));
        renderer.render(&second).unwrap();
        assert_eq!(next_track(&mut events).await, None);
        assert_eq!(renderer.stream_id().as_deref(), Some("s2"));

        // changes on the old stream are no longer observed
        first.add_track(video("v3"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_none());
        assert!(surface.attached_track().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_refresh() {
        let (renderer, surface, _events) = renderer();
        let params = RenderParams { mirrored: true, ..RenderParams::default() };
        renderer.refresh(params.clone()).unwrap();
        assert_eq!(surface.params(), params);

        assert!(renderer.close());
        assert!(!renderer.close());
        assert!(renderer.refresh(RenderParams::default()).is_err());
    }

    #[tokio::test]
    async fn test_released_stream_clears_selection() {
        let (renderer, surface, mut events) = renderer();
        let stream = MediaStream::new(FakeStream::new("s1"), 16);
        stream.insert_track(video("v1"));
        renderer.render(&stream).unwrap();
        assert_eq!(next_track(&mut events).await.as_deref(), Some("v1"));

        stream.release();
        assert_eq!(next_track(&mut events).await, None);
        assert!(surface.attached_track().is_none());
    }

    #[test]
    fn test_render_params_from_host_json() {
        let params: RenderParams =
            serde_json::from_str(r#"{"elementLeft":10,"elementWidth":320,"zIndex":2,"objectFit":"cover"}"#).unwrap();
        assert_eq!(params.element_width, 320.0);
        assert_eq!(params.z_index, 2.0);
        assert_eq!(params.object_fit, "cover");
        assert!(params.visible);
    }
}
