//! Media stream track wrapper
//!
//! A track is owned by the global track registry and shared by reference
//! between any number of streams.

use super::events::{Listener, TrackEvent, TrackInfo};
use super::TrackId;
use crate::engine::{EngineTrack, TrackKind, TrackState};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct MediaStreamTrack {
    id: TrackId,
    kind: TrackKind,
    label: String,
    engine: Arc<dyn EngineTrack>,
    enabled: AtomicBool,
    ended: AtomicBool,
    listeners: Mutex<Vec<Listener<TrackEvent>>>,
    /// Pump for engine-originated state changes
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl MediaStreamTrack {
    pub fn new(engine: Arc<dyn EngineTrack>) -> Arc<Self> {
        Arc::new(Self {
            id: engine.id(),
            kind: engine.kind(),
            label: engine.label(),
            engine,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn engine(&self) -> &Arc<dyn EngineTrack> {
        &self.engine
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        !self.ended.load(Ordering::Acquire)
    }

    pub fn ready_state(&self) -> TrackState {
        if self.is_live() {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            enabled: self.is_enabled(),
            ready_state: self.ready_state(),
        }
    }

    pub(crate) fn set_observer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.observer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Add a kept-open listener. A listener added after the track ended gets
    /// the ended notification straight away.
    pub fn add_listener(&self, listener: Listener<TrackEvent>) {
        if !self.is_live() {
            listener.emit(TrackEvent::StateChange { ready_state: TrackState::Ended });
            return;
        }
        self.listeners.lock().push(listener);
    }

    /// Toggle local processing without destroying the track
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_live() {
            debug!("Track {} ended, ignoring set_enabled({})", self.id, enabled);
            return;
        }
        self.enabled.store(enabled, Ordering::Release);
        self.engine.set_enabled(enabled);
        debug!("Track {} enabled={}", self.id, enabled);
    }

    /// Permanently halt the track. Returns false if it had already ended.
    pub fn stop(&self) -> bool {
        self.finish(true)
    }

    /// Record an engine-originated end. Returns false if it had already ended.
    pub fn mark_ended(&self) -> bool {
        self.finish(false)
    }

    fn finish(&self, stop_engine: bool) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        if stop_engine {
            self.engine.stop();
        }
        if let Some(observer) = self.observer.lock().take() {
            observer.abort();
        }

        // One-time notification; listeners are released afterwards
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            listener.emit(TrackEvent::StateChange { ready_state: TrackState::Ended });
        }
        info!("Track {} ended ({} listeners notified)", self.id, listeners.len());
        true
    }
}

impl Drop for MediaStreamTrack {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.get_mut().take() {
            observer.abort();
        }
    }
}
