//! Media stream wrapper
//!
//! A stream keeps its own ordered audio and video track sets. Tracks are
//! shared by `Arc` with the global track registry and with any other stream
//! holding them. Every change to the sets is broadcast, so renderers and
//! host listeners see it without re-fetching.

use super::events::{StreamEvent, StreamInfo};
use super::track::MediaStreamTrack;
use super::StreamId;
use crate::engine::{EngineStream, TrackKind};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Default)]
struct TrackSets {
    audio: Vec<Arc<MediaStreamTrack>>,
    video: Vec<Arc<MediaStreamTrack>>,
}

impl TrackSets {
    fn set_mut(&mut self, kind: TrackKind) -> &mut Vec<Arc<MediaStreamTrack>> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    fn contains(&self, track_id: &str) -> bool {
        self.audio.iter().chain(self.video.iter()).any(|t| t.id() == track_id)
    }
}

pub struct MediaStream {
    id: StreamId,
    engine: Arc<dyn EngineStream>,
    tracks: Mutex<TrackSets>,
    events: broadcast::Sender<StreamEvent>,
    released: AtomicBool,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl MediaStream {
    /// Wrap an engine stream with empty track sets; callers populate them
    /// with registered tracks via `insert_track`.
    pub fn new(engine: Arc<dyn EngineStream>, event_capacity: usize) -> Arc<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            id: engine.id(),
            engine,
            tracks: Mutex::new(TrackSets::default()),
            events,
            released: AtomicBool::new(false),
            observer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<dyn EngineStream> {
        &self.engine
    }

    pub(crate) fn set_observer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.observer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Receive every subsequent track-set change
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StreamEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Add a track to the local sets only. Returns false if already present.
    pub fn insert_track(&self, track: Arc<MediaStreamTrack>) -> bool {
        {
            let mut sets = self.tracks.lock();
            if sets.contains(track.id()) {
                return false;
            }
            sets.set_mut(track.kind()).push(track.clone());
        }
        debug!("Stream {}: track {} added", self.id, track.id());
        self.notify(StreamEvent::AddTrack { track: track.info() });
        true
    }

    /// Add a track to the engine stream and to the local sets
    pub fn add_track(&self, track: Arc<MediaStreamTrack>) -> bool {
        if self.contains_track(track.id()) {
            return false;
        }
        self.engine.add_track(track.engine());
        self.insert_track(track)
    }

    /// Drop a track from the local sets only. Absent tracks are a no-op.
    pub fn detach_track(&self, track_id: &str) -> Option<Arc<MediaStreamTrack>> {
        let removed = {
            let mut sets = self.tracks.lock();
            let position = |set: &Vec<Arc<MediaStreamTrack>>| set.iter().position(|t| t.id() == track_id);
            if let Some(idx) = position(&sets.audio) {
                Some(sets.audio.remove(idx))
            } else if let Some(idx) = position(&sets.video) {
                Some(sets.video.remove(idx))
            } else {
                None
            }
        };

        if let Some(track) = &removed {
            debug!("Stream {}: track {} removed", self.id, track_id);
            self.notify(StreamEvent::RemoveTrack {
                track_id: track_id.to_string(),
                kind: track.kind(),
            });
        }
        removed
    }

    /// Remove a track from the engine stream and the local sets; idempotent
    pub fn remove_track(&self, track_id: &str) -> Option<Arc<MediaStreamTrack>> {
        let removed = self.detach_track(track_id)?;
        self.engine.remove_track(track_id);
        Some(removed)
    }

    pub fn contains_track(&self, track_id: &str) -> bool {
        self.tracks.lock().contains(track_id)
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks.lock().audio.clone()
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaStreamTrack>> {
        self.tracks.lock().video.clone()
    }

    /// The most recently added video track that is still live
    pub fn current_video_track(&self) -> Option<Arc<MediaStreamTrack>> {
        self.tracks.lock().video.iter().rev().find(|t| t.is_live()).cloned()
    }

    /// Tell subscribers that a member track ended. Ended tracks stay in the
    /// sets until explicitly removed.
    pub fn notify_track_ended(&self, track_id: &str) {
        if self.contains_track(track_id) {
            self.notify(StreamEvent::TrackEnded { track_id: track_id.to_string() });
        }
    }

    /// Mark the stream released and tell subscribers. Returns false if it was
    /// already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }
        self.notify(StreamEvent::Released);
        info!("Stream {} released", self.id);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn info(&self) -> StreamInfo {
        let sets = self.tracks.lock();
        StreamInfo {
            id: self.id.clone(),
            audio_tracks: sets.audio.iter().map(|t| t.info()).collect(),
            video_tracks: sets.video.iter().map(|t| t.info()).collect(),
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get_mut().take() {
            observer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeStream, FakeTrack};

    fn track(id: &str, kind: TrackKind) -> Arc<MediaStreamTrack> {
        MediaStreamTrack::new(FakeTrack::new(id, kind))
    }

    #[tokio::test]
    async fn test_track_changes_reach_every_subscriber() {
        let stream = MediaStream::new(FakeStream::new("s1"), 16);
        let mut renderer_side = stream.subscribe();
        let mut host_side = stream.subscribe();

        assert!(stream.add_track(track("v1", TrackKind::Video)));
        for rx in [&mut renderer_side, &mut host_side] {
            match rx.recv().await.unwrap() {
                StreamEvent::AddTrack { track } => assert_eq!(track.id, "v1"),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_remove_missing_track_is_noop() {
        let engine = FakeStream::new("s2");
        let stream = MediaStream::new(engine.clone(), 16);
        stream.add_track(track("a1", TrackKind::Audio));

        assert!(stream.remove_track("nope").is_none());
        assert!(stream.remove_track("a1").is_some());
        assert!(stream.remove_track("a1").is_none());
        assert!(engine.audio_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_track_ignored() {
        let stream = MediaStream::new(FakeStream::new("s3"), 16);
        let shared = track("a1", TrackKind::Audio);
        assert!(stream.add_track(shared.clone()));
        assert!(!stream.add_track(shared));
        assert_eq!(stream.audio_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_current_video_track_skips_ended() {
        let stream = MediaStream::new(FakeStream::new("s4"), 16);
        let first = track("v1", TrackKind::Video);
        let second = track("v2", TrackKind::Video);
        stream.insert_track(first.clone());
        stream.insert_track(second.clone());
        assert_eq!(stream.current_video_track().unwrap().id(), "v2");

        second.stop();
        assert_eq!(stream.current_video_track().unwrap().id(), "v1");
        first.stop();
        assert!(stream.current_video_track().is_none());
    }
}
