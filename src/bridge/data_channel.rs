//! Data channel wrapper
//!
//! Each channel runs a pump that forwards engine events to the host
//! listener. Channels opened by the remote peer have no listener until the
//! host attaches one, so events are buffered until then.

use super::events::{DataChannelEvent, Listener, SendReceipt};
use super::registry::Registry;
use super::{BridgeError, ConnectionId, DataChannelId};
use crate::engine::{ChannelPayload, DataChannelInfo, DataChannelState, EngineDataChannel};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

enum Delivery {
    /// No listener yet; events wait here
    Buffering(Vec<DataChannelEvent>),
    Attached(Listener<DataChannelEvent>),
    /// Channel reached `closed`; nothing more is delivered
    Finished,
}

pub struct DataChannel {
    id: DataChannelId,
    pc_id: ConnectionId,
    engine: Arc<dyn EngineDataChannel>,
    delivery: Mutex<Delivery>,
    closed: AtomicBool,
}

impl DataChannel {
    /// Wrap an engine channel. Nothing is delivered until `start`.
    pub fn new(
        pc_id: ConnectionId,
        id: DataChannelId,
        engine: Arc<dyn EngineDataChannel>,
        listener: Option<Listener<DataChannelEvent>>,
    ) -> Arc<Self> {
        let delivery = match listener {
            Some(listener) => Delivery::Attached(listener),
            None => Delivery::Buffering(Vec::new()),
        };
        Arc::new(Self {
            id,
            pc_id,
            engine,
            delivery: Mutex::new(delivery),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the event pump.
    ///
    /// The pump keeps the channel alive until `closed` has been delivered,
    /// so the host hears it even when the owning connection already let go.
    /// Once the channel reports `closed` it removes itself from `owner`. A
    /// repeated state is delivered once.
    pub fn start(self: &Arc<Self>, owner: Weak<Registry<DataChannelId, DataChannel>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.engine.observe(tx);

        let channel = self.clone();
        tokio::spawn(async move {
            let mut last_state = None;
            while let Some(event) = rx.recv().await {
                if let DataChannelEvent::StateChange { ready_state } = event {
                    if last_state == Some(ready_state) {
                        continue;
                    }
                    last_state = Some(ready_state);
                    if ready_state == DataChannelState::Closed {
                        channel.finish(&owner, event);
                        return;
                    }
                }
                channel.deliver(event);
            }

            // Engine dropped the channel without reporting it
            debug!("Connection {}: data channel {} engine gone", channel.pc_id, channel.id);
            channel.finish(
                &owner,
                DataChannelEvent::StateChange { ready_state: DataChannelState::Closed },
            );
        });
    }

    fn finish(&self, owner: &Weak<Registry<DataChannelId, DataChannel>>, closed: DataChannelEvent) {
        // Unresolvable before the host hears about the close
        self.closed.store(true, Ordering::Release);
        if let Some(owner) = owner.upgrade() {
            owner.remove(&self.id);
        }
        self.deliver(closed);
        info!("Connection {}: data channel {} closed", self.pc_id, self.id);
    }

    pub fn id(&self) -> DataChannelId {
        self.id
    }

    pub fn label(&self) -> String {
        self.engine.label()
    }

    pub fn ready_state(&self) -> DataChannelState {
        self.engine.ready_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn deliver(&self, event: DataChannelEvent) {
        let closing = matches!(
            event,
            DataChannelEvent::StateChange { ready_state: DataChannelState::Closed }
        );
        let mut delivery = self.delivery.lock();
        match &mut *delivery {
            Delivery::Buffering(pending) => pending.push(event),
            Delivery::Attached(listener) => {
                if !listener.emit(event) {
                    debug!("Connection {}: data channel {} listener gone", self.pc_id, self.id);
                }
                if closing {
                    *delivery = Delivery::Finished;
                }
            }
            Delivery::Finished => {}
        }
    }

    /// Attach (or replace) the host listener, flushing buffered events first
    pub fn set_listener(&self, listener: Listener<DataChannelEvent>) {
        let mut delivery = self.delivery.lock();
        match std::mem::replace(&mut *delivery, Delivery::Finished) {
            Delivery::Buffering(pending) => {
                debug!(
                    "Connection {}: data channel {} listener attached, flushing {} events",
                    self.pc_id,
                    self.id,
                    pending.len()
                );
                let closed_already = pending.iter().any(|e| {
                    matches!(e, DataChannelEvent::StateChange { ready_state: DataChannelState::Closed })
                });
                for event in pending {
                    listener.emit(event);
                }
                if !closed_already {
                    *delivery = Delivery::Attached(listener);
                }
            }
            Delivery::Attached(_) => {
                debug!("Connection {}: data channel {} listener replaced", self.pc_id, self.id);
                *delivery = Delivery::Attached(listener);
            }
            Delivery::Finished => {
                warn!("Connection {}: data channel {} already finished", self.pc_id, self.id);
            }
        }
    }

    pub async fn send(&self, payload: ChannelPayload) -> Result<SendReceipt, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::InvalidState(format!("data channel {} is closed", self.id)));
        }
        let size = payload.len();
        let buffered_amount = self.engine.send(payload).await?;
        debug!(
            "Connection {}: data channel {} sent {} bytes (buffered {})",
            self.pc_id, self.id, size, buffered_amount
        );
        Ok(SendReceipt { buffered_amount })
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.close().await?;
        Ok(())
    }

    pub fn info(&self) -> DataChannelInfo {
        let init = self.engine.init();
        DataChannelInfo {
            dc_id: self.id,
            label: self.engine.label(),
            ordered: init.ordered.unwrap_or(true),
            protocol: init.protocol.unwrap_or_default(),
            negotiated: init.negotiated,
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            ready_state: self.engine.ready_state(),
        }
    }
}
