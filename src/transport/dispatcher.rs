//! Request dispatch
//!
//! Maps every host call onto the orchestrator and funnels all results and
//! kept-open event streams into one outbound queue per host connection.
//! Nothing here ever waits on a connection timeline: replies are awaited on
//! their own tasks.

use super::protocol::{decode_binary, Call, CallbackId, HostMessage, Request};
use crate::bridge::events::{ConnectionEvent, DataChannelEvent, EventSink, Listener, Subscription};
use crate::bridge::timeline::Reply;
use crate::bridge::{BridgeError, HeadlessSurface, Orchestrator};
use crate::engine::ChannelPayload;
use bytes::Bytes;
use log::{debug, warn};
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Dispatcher {
    orchestrator: Orchestrator,
    outbound: mpsc::UnboundedSender<HostMessage>,
}

/// Kept-open host callback fed inline by the emitting task, so its events
/// share one ordered path with the replies of the same connection. Sends
/// `finished` when the last listener goes away.
struct HostCallback {
    id: CallbackId,
    outbound: mpsc::UnboundedSender<HostMessage>,
    released: AtomicBool,
}

impl HostCallback {
    fn new(id: CallbackId, outbound: mpsc::UnboundedSender<HostMessage>) -> Arc<Self> {
        Arc::new(Self {
            id,
            outbound,
            released: AtomicBool::new(false),
        })
    }

    /// Report the failure that kept the callback from ever opening
    fn fail(&self, reason: impl Display) {
        self.released.store(true, Ordering::Release);
        let _ = self.outbound.send(HostMessage::error(self.id, reason));
    }
}

impl<E: Serialize> EventSink<E> for HostCallback {
    fn deliver(&self, event: E) -> bool {
        self.outbound.send(HostMessage::event(self.id, &event)).is_ok()
    }
}

impl Drop for HostCallback {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            let _ = self.outbound.send(HostMessage::finished(self.id));
        }
    }
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator, outbound: mpsc::UnboundedSender<HostMessage>) -> Self {
        Self { orchestrator, outbound }
    }

    fn send(&self, message: HostMessage) {
        if self.outbound.send(message).is_err() {
            debug!("Host connection gone, message dropped");
        }
    }

    /// Deliver a one-shot result
    fn respond<T: Serialize>(&self, id: CallbackId, result: Result<T, BridgeError>) {
        self.send(match result {
            Ok(data) => HostMessage::done(id, &data),
            Err(e) => HostMessage::error(id, e),
        });
    }

    /// Deliver a reply once it resolves
    fn reply<T>(&self, id: CallbackId, reply: Reply<T>)
    where
        T: Serialize + Send + 'static,
    {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let message = match reply.await {
                Ok(data) => HostMessage::done(id, &data),
                Err(e) => HostMessage::error(id, e),
            };
            let _ = outbound.send(message);
        });
    }

    /// Side-effect-only operation: failures are logged, never reported
    fn fire_and_forget<T: Send + 'static>(&self, method: &'static str, reply: Reply<T>) {
        tokio::spawn(async move {
            if let Err(e) = reply.await {
                warn!("{} dropped: {}", method, e);
            }
        });
    }

    fn fire_and_forget_now(&self, method: &'static str, result: Result<(), BridgeError>) {
        if let Err(e) = result {
            warn!("{} dropped: {}", method, e);
        }
    }

    /// Forward a kept-open subscription until it ends, then release the
    /// host callback
    fn keep<E>(&self, id: CallbackId, mut events: Subscription<E>)
    where
        E: Serialize + Send + 'static,
    {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if outbound.send(HostMessage::event(id, &event)).is_err() {
                    return;
                }
            }
            let _ = outbound.send(HostMessage::finished(id));
        });
    }

    /// Report a subscription, or the error that prevented it
    fn subscribe<E>(&self, id: CallbackId, result: Result<Subscription<E>, BridgeError>)
    where
        E: Serialize + Send + 'static,
    {
        match result {
            Ok(events) => self.keep(id, events),
            Err(e) => self.send(HostMessage::error(id, e)),
        }
    }

    /// Data channel events: binary payloads travel on the binary path
    fn subscribe_channel(&self, id: CallbackId, reply: Reply<Subscription<DataChannelEvent>>) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let mut events = match reply.await {
                Ok(events) => events,
                Err(e) => {
                    let _ = outbound.send(HostMessage::error(id, e));
                    return;
                }
            };
            while let Some(event) = events.recv().await {
                let message = match &event {
                    DataChannelEvent::BinaryMessage(data) => HostMessage::binary(id, data),
                    _ => HostMessage::event(id, &event),
                };
                if outbound.send(message).is_err() {
                    return;
                }
            }
            let _ = outbound.send(HostMessage::finished(id));
        });
    }

    /// Raw text from the host
    pub fn handle_text(&self, text: &str) {
        match Request::from_json(text) {
            Ok(request) => self.handle(request),
            Err(e) => match e.id {
                Some(id) => self.send(HostMessage::error(id, &e)),
                None => warn!("{}", e),
            },
        }
    }

    pub fn handle(&self, request: Request) {
        let Request { id, call } = request;
        let bridge = &self.orchestrator;
        debug!("Host call {} ({})", call.method(), id);

        match call {
            Call::NewConnection {
                pc_id,
                pc_config,
                pc_constraints,
            } => {
                let bridge = bridge.clone();
                let callback = HostCallback::new(id, self.outbound.clone());
                tokio::spawn(async move {
                    let sink: Arc<dyn EventSink<ConnectionEvent>> = callback.clone();
                    if let Err(e) = bridge
                        .new_connection_with_listener(pc_id, pc_config, pc_constraints, Listener::sink(sink))
                        .await
                    {
                        callback.fail(e);
                    }
                });
            }
            Call::CreateOffer { pc_id, options } => self.reply(id, bridge.create_offer(pc_id, options)),
            Call::CreateAnswer { pc_id, options } => self.reply(id, bridge.create_answer(pc_id, options)),
            Call::SetLocalDescription { pc_id, desc } => self.reply(id, bridge.set_local_description(pc_id, desc)),
            Call::SetRemoteDescription { pc_id, desc } => self.reply(id, bridge.set_remote_description(pc_id, desc)),
            Call::AddIceCandidate { pc_id, candidate } => self.reply(id, bridge.add_ice_candidate(pc_id, candidate)),
            Call::AddStream { pc_id, stream_id } => {
                self.fire_and_forget("addStream", bridge.add_stream(pc_id, &stream_id))
            }
            Call::RemoveStream { pc_id, stream_id } => {
                self.fire_and_forget("removeStream", bridge.remove_stream(pc_id, &stream_id))
            }
            Call::CreateDataChannel {
                pc_id,
                dc_id,
                label,
                options,
            } => self.subscribe_channel(id, bridge.create_data_channel(pc_id, dc_id, label, options)),
            Call::DataChannelSetListener { pc_id, dc_id } => {
                self.subscribe_channel(id, bridge.set_data_channel_listener(pc_id, dc_id))
            }
            Call::DataChannelSendString { pc_id, dc_id, data } => {
                self.reply(id, bridge.send_data(pc_id, dc_id, ChannelPayload::Text(data)))
            }
            Call::DataChannelSendBinary { pc_id, dc_id, data } => match decode_binary(&data) {
                Ok(bytes) => self.reply(id, bridge.send_data(pc_id, dc_id, ChannelPayload::Binary(Bytes::from(bytes)))),
                Err(reason) => self.send(HostMessage::error(id, reason)),
            },
            Call::DataChannelClose { pc_id, dc_id } => {
                self.fire_and_forget("dataChannel.close", bridge.close_data_channel(pc_id, dc_id))
            }
            Call::CloseConnection { pc_id } => self.fire_and_forget("closeConnection", bridge.close_connection(pc_id)),
            Call::StreamSetListener { stream_id } => self.subscribe(id, bridge.set_stream_listener(&stream_id)),
            Call::StreamAddTrack { stream_id, track_id } => {
                self.fire_and_forget("mediaStream.addTrack", bridge.stream_add_track(&stream_id, &track_id))
            }
            Call::StreamRemoveTrack { stream_id, track_id } => self.fire_and_forget(
                "mediaStream.removeTrack",
                bridge.stream_remove_track(&stream_id, &track_id),
            ),
            Call::StreamRelease { stream_id } => {
                self.fire_and_forget_now("mediaStream.release", bridge.release_stream(&stream_id))
            }
            Call::TrackSetListener { track_id } => self.subscribe(id, bridge.set_track_listener(&track_id)),
            Call::TrackSetEnabled { track_id, enabled } => {
                self.fire_and_forget("track.setEnabled", bridge.set_track_enabled(&track_id, enabled))
            }
            Call::TrackStop { track_id } => self.fire_and_forget("track.stop", bridge.stop_track(&track_id)),
            Call::NewRenderer { renderer_id } => {
                self.subscribe(id, bridge.new_renderer(renderer_id, HeadlessSurface::new()))
            }
            Call::RendererRender { renderer_id, stream_id } => {
                self.fire_and_forget_now("renderer.render", bridge.render(renderer_id, &stream_id))
            }
            Call::RendererRefresh { renderer_id, data } => {
                self.fire_and_forget_now("renderer.refresh", bridge.refresh_renderer(renderer_id, data))
            }
            Call::RendererMediaStreamChanged { renderer_id } => self.fire_and_forget_now(
                "renderer.mediaStreamChanged",
                bridge.media_stream_changed(renderer_id),
            ),
            Call::RendererClose { renderer_id } => {
                self.fire_and_forget_now("renderer.close", bridge.close_renderer(renderer_id))
            }
            Call::GetUserMedia { constraints } => self.reply(id, bridge.get_user_media(constraints)),
            Call::EnumerateDevices => self.reply(id, bridge.enumerate_devices()),
            Call::SelectAudioOutput { output } => self.respond(id, bridge.select_audio_output(output)),
            Call::Dump => self.respond(id, Ok(bridge.dump())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::fake::FakeEngine;
    use serde_json::Value;
    use std::time::Duration;

    fn dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<HostMessage>) {
        let bridge = Orchestrator::new(FakeEngine::new(), BridgeConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(bridge, tx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<HostMessage>) -> HostMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("host message in time")
            .expect("outbound open")
    }

    fn data(message: HostMessage) -> Value {
        match message {
            HostMessage::Ok { data, .. } => data,
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_round_trip_over_wire() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"newConnection","pcId":1}}"#);
        // the connection exists once dump can see it
        tokio::time::sleep(Duration::from_millis(20)).await;

        dispatcher.handle_text(r#"{"id":2,"call":{"method":"createOffer","pcId":1,"options":{}}}"#);
        let offer = next(&mut rx).await;
        assert_eq!(offer.id(), 2);
        let offer = data(offer);
        assert_eq!(offer["type"], "offer");
        assert!(!offer["sdp"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_event_sent_before_the_ack_that_raised_it() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"newConnection","pcId":1}}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;

        dispatcher.handle_text(
            r#"{"id":2,"call":{"method":"setLocalDescription","pcId":1,"desc":{"type":"offer","sdp":"v=0"}}}"#,
        );
        let first = next(&mut rx).await;
        assert_eq!(first.id(), 1);
        assert_eq!(data(first)["signalingState"], "have-local-offer");
        assert_eq!(next(&mut rx).await, HostMessage::done(2, &Value::Null));
    }

    #[tokio::test]
    async fn test_connection_callback_finishes_on_close() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"newConnection","pcId":1}}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.handle_text(r#"{"id":2,"call":{"method":"closeConnection","pcId":1}}"#);
        assert_eq!(next(&mut rx).await, HostMessage::finished(1));
    }

    #[tokio::test]
    async fn test_duplicate_connection_reports_error_only() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"newConnection","pcId":1}}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.handle_text(r#"{"id":2,"call":{"method":"newConnection","pcId":1}}"#);
        assert_eq!(next(&mut rx).await, HostMessage::error(2, "connection 1 already exists"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_connection_reports_error() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":7,"call":{"method":"createAnswer","pcId":42}}"#);
        assert_eq!(
            next(&mut rx).await,
            HostMessage::error(7, "connection 42 does not exist")
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_failure_is_silent() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"removeStream","pcId":1,"streamId":"gone"}}"#);
        dispatcher.handle_text(r#"{"id":2,"call":{"method":"track.stop","trackId":"gone"}}"#);
        dispatcher.handle_text(r#"{"id":3,"call":{"method":"dump"}}"#);
        let dump = next(&mut rx).await;
        assert_eq!(dump.id(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_request_with_id_gets_error() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":4,"call":{"method":"createOffer"}}"#);
        assert!(matches!(next(&mut rx).await, HostMessage::Error { id: 4, .. }));
    }

    #[tokio::test]
    async fn test_data_channel_events_and_binary_send() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"newConnection","pcId":1}}"#);
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.handle_text(
            r#"{"id":2,"call":{"method":"createDataChannel","pcId":1,"dcId":3,"label":"chat"}}"#,
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the fake channel is still connecting, so the send fails with the engine's reason
        dispatcher.handle_text(r#"{"id":5,"call":{"method":"dataChannel.sendBinary","pcId":1,"dcId":3,"data":"AAE="}}"#);
        assert_eq!(next(&mut rx).await, HostMessage::error(5, "DataChannel is not opened"));

        dispatcher.handle_text(r#"{"id":6,"call":{"method":"dataChannel.sendBinary","pcId":1,"dcId":3,"data":"***"}}"#);
        assert!(matches!(next(&mut rx).await, HostMessage::Error { id: 6, .. }));

        dispatcher.handle_text(r#"{"id":7,"call":{"method":"closeConnection","pcId":1}}"#);
        let mut channel_messages = Vec::new();
        while channel_messages.len() < 2 {
            let message = next(&mut rx).await;
            if message.id() == 2 {
                channel_messages.push(message);
            }
        }
        assert_eq!(data(channel_messages[0].clone())["readyState"], "closed");
        assert_eq!(channel_messages[1], HostMessage::finished(2));
    }

    #[tokio::test]
    async fn test_capture_then_release_over_wire() {
        let (dispatcher, mut rx) = dispatcher();
        dispatcher.handle_text(r#"{"id":1,"call":{"method":"getUserMedia","constraints":{"audio":true}}}"#);
        let stream = data(next(&mut rx).await);
        let stream_id = stream["id"].as_str().unwrap().to_string();
        assert_eq!(stream["audioTracks"].as_array().unwrap().len(), 1);

        dispatcher.handle_text(&format!(
            r#"{{"id":2,"call":{{"method":"mediaStream.release","streamId":"{}"}}}}"#,
            stream_id
        ));
        dispatcher.handle_text(&format!(
            r#"{{"id":3,"call":{{"method":"mediaStream.setListener","streamId":"{}"}}}}"#,
            stream_id
        ));
        assert!(matches!(next(&mut rx).await, HostMessage::Error { id: 3, .. }));
    }
}
