//! Host wire protocol
//!
//! Requests carry the host's callback id and one call:
//! `{"id": 7, "call": {"method": "createOffer", "pcId": 1, "options": {}}}`.
//! Every message back is tagged by `status`:
//! - `ok`: JSON `data`; `keep` tells the host whether the callback stays open
//! - `binary`: base64 `data` on a kept-open callback (data channel payloads)
//! - `error`: one-shot failure with a human-readable `reason`

use crate::bridge::renderer::RenderParams;
use crate::bridge::{ConnectionId, DataChannelId, RendererId, StreamId, TrackId};
use crate::engine::{
    AnswerOptions, AudioOutput, DataChannelInit, IceCandidate, MediaConstraints, OfferOptions,
    PeerConnectionConfig, SessionDescription,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;

/// Host callback id
pub type CallbackId = u64;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: CallbackId,
    pub call: Call,
}

/// Every operation the host can invoke
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Call {
    NewConnection {
        pc_id: ConnectionId,
        #[serde(default)]
        pc_config: Option<PeerConnectionConfig>,
        #[serde(default)]
        pc_constraints: Option<Value>,
    },
    CreateOffer {
        pc_id: ConnectionId,
        #[serde(default)]
        options: OfferOptions,
    },
    CreateAnswer {
        pc_id: ConnectionId,
        #[serde(default)]
        options: AnswerOptions,
    },
    SetLocalDescription {
        pc_id: ConnectionId,
        desc: SessionDescription,
    },
    SetRemoteDescription {
        pc_id: ConnectionId,
        desc: SessionDescription,
    },
    AddIceCandidate {
        pc_id: ConnectionId,
        candidate: IceCandidate,
    },
    AddStream {
        pc_id: ConnectionId,
        stream_id: StreamId,
    },
    RemoveStream {
        pc_id: ConnectionId,
        stream_id: StreamId,
    },
    CreateDataChannel {
        pc_id: ConnectionId,
        dc_id: DataChannelId,
        label: String,
        #[serde(default)]
        options: DataChannelInit,
    },
    #[serde(rename = "dataChannel.setListener")]
    DataChannelSetListener { pc_id: ConnectionId, dc_id: DataChannelId },
    #[serde(rename = "dataChannel.sendString")]
    DataChannelSendString {
        pc_id: ConnectionId,
        dc_id: DataChannelId,
        data: String,
    },
    /// `data` is base64
    #[serde(rename = "dataChannel.sendBinary")]
    DataChannelSendBinary {
        pc_id: ConnectionId,
        dc_id: DataChannelId,
        data: String,
    },
    #[serde(rename = "dataChannel.close")]
    DataChannelClose { pc_id: ConnectionId, dc_id: DataChannelId },
    CloseConnection {
        pc_id: ConnectionId,
    },
    #[serde(rename = "mediaStream.setListener")]
    StreamSetListener { stream_id: StreamId },
    #[serde(rename = "mediaStream.addTrack")]
    StreamAddTrack { stream_id: StreamId, track_id: TrackId },
    #[serde(rename = "mediaStream.removeTrack")]
    StreamRemoveTrack { stream_id: StreamId, track_id: TrackId },
    #[serde(rename = "mediaStream.release")]
    StreamRelease { stream_id: StreamId },
    #[serde(rename = "track.setListener")]
    TrackSetListener { track_id: TrackId },
    #[serde(rename = "track.setEnabled")]
    TrackSetEnabled { track_id: TrackId, enabled: bool },
    #[serde(rename = "track.stop")]
    TrackStop { track_id: TrackId },
    NewRenderer {
        renderer_id: RendererId,
    },
    #[serde(rename = "renderer.render")]
    RendererRender { renderer_id: RendererId, stream_id: StreamId },
    #[serde(rename = "renderer.refresh")]
    RendererRefresh {
        renderer_id: RendererId,
        #[serde(default)]
        data: RenderParams,
    },
    #[serde(rename = "renderer.mediaStreamChanged")]
    RendererMediaStreamChanged { renderer_id: RendererId },
    #[serde(rename = "renderer.close")]
    RendererClose { renderer_id: RendererId },
    GetUserMedia {
        #[serde(default)]
        constraints: MediaConstraints,
    },
    EnumerateDevices,
    SelectAudioOutput {
        output: AudioOutput,
    },
    Dump,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::NewConnection { .. } => "newConnection",
            Call::CreateOffer { .. } => "createOffer",
            Call::CreateAnswer { .. } => "createAnswer",
            Call::SetLocalDescription { .. } => "setLocalDescription",
            Call::SetRemoteDescription { .. } => "setRemoteDescription",
            Call::AddIceCandidate { .. } => "addIceCandidate",
            Call::AddStream { .. } => "addStream",
            Call::RemoveStream { .. } => "removeStream",
            Call::CreateDataChannel { .. } => "createDataChannel",
            Call::DataChannelSetListener { .. } => "dataChannel.setListener",
            Call::DataChannelSendString { .. } => "dataChannel.sendString",
            Call::DataChannelSendBinary { .. } => "dataChannel.sendBinary",
            Call::DataChannelClose { .. } => "dataChannel.close",
            Call::CloseConnection { .. } => "closeConnection",
            Call::StreamSetListener { .. } => "mediaStream.setListener",
            Call::StreamAddTrack { .. } => "mediaStream.addTrack",
            Call::StreamRemoveTrack { .. } => "mediaStream.removeTrack",
            Call::StreamRelease { .. } => "mediaStream.release",
            Call::TrackSetListener { .. } => "track.setListener",
            Call::TrackSetEnabled { .. } => "track.setEnabled",
            Call::TrackStop { .. } => "track.stop",
            Call::NewRenderer { .. } => "newRenderer",
            Call::RendererRender { .. } => "renderer.render",
            Call::RendererRefresh { .. } => "renderer.refresh",
            Call::RendererMediaStreamChanged { .. } => "renderer.mediaStreamChanged",
            Call::RendererClose { .. } => "renderer.close",
            Call::GetUserMedia { .. } => "getUserMedia",
            Call::EnumerateDevices => "enumerateDevices",
            Call::SelectAudioOutput { .. } => "selectAudioOutput",
            Call::Dump => "dump",
        }
    }
}

/// Malformed request. Carries the callback id when it could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub id: Option<CallbackId>,
    pub reason: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "Invalid request {}: {}", id, self.reason),
            None => write!(f, "Invalid request: {}", self.reason),
        }
    }
}

impl Error for ProtocolError {}

impl Request {
    /// Parse a request from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(json).map_err(|e| ProtocolError {
            id: None,
            reason: e.to_string(),
        })?;
        let id = value.get("id").and_then(Value::as_u64);
        serde_json::from_value(value).map_err(|e| ProtocolError {
            id,
            reason: e.to_string(),
        })
    }
}

/// Message delivered to a host callback
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HostMessage {
    Ok { id: CallbackId, keep: bool, data: Value },
    Binary { id: CallbackId, keep: bool, data: String },
    Error { id: CallbackId, reason: String },
}

impl HostMessage {
    /// One-shot success
    pub fn done<T: Serialize>(id: CallbackId, data: &T) -> Self {
        Self::ok(id, false, data)
    }

    /// Event on a kept-open callback
    pub fn event<T: Serialize>(id: CallbackId, data: &T) -> Self {
        Self::ok(id, true, data)
    }

    /// Releases a kept-open callback
    pub fn finished(id: CallbackId) -> Self {
        HostMessage::Ok {
            id,
            keep: false,
            data: Value::Null,
        }
    }

    pub fn binary(id: CallbackId, data: &[u8]) -> Self {
        HostMessage::Binary {
            id,
            keep: true,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    pub fn error(id: CallbackId, reason: impl fmt::Display) -> Self {
        HostMessage::Error {
            id,
            reason: reason.to_string(),
        }
    }

    fn ok<T: Serialize>(id: CallbackId, keep: bool, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => HostMessage::Ok { id, keep, data },
            Err(e) => HostMessage::error(id, format!("Failed to serialize result: {}", e)),
        }
    }

    pub fn id(&self) -> CallbackId {
        match self {
            HostMessage::Ok { id, .. } | HostMessage::Binary { id, .. } | HostMessage::Error { id, .. } => *id,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode the base64 body of a `dataChannel.sendBinary` call
pub fn decode_binary(data: &str) -> Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| format!("Invalid base64 payload: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Constraint, SdpType};

    #[test]
    fn test_parse_create_offer() {
        let req = Request::from_json(r#"{"id":3,"call":{"method":"createOffer","pcId":1}}"#).unwrap();
        assert_eq!(req.id, 3);
        match req.call {
            Call::CreateOffer { pc_id, options } => {
                assert_eq!(pc_id, 1);
                assert_eq!(options, OfferOptions::default());
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_parse_dotted_methods() {
        let req = Request::from_json(
            r#"{"id":9,"call":{"method":"dataChannel.sendString","pcId":1,"dcId":2,"data":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(req.call.method(), "dataChannel.sendString");

        let req =
            Request::from_json(r#"{"id":10,"call":{"method":"track.setEnabled","trackId":"t","enabled":false}}"#)
                .unwrap();
        assert!(matches!(req.call, Call::TrackSetEnabled { enabled: false, .. }));
    }

    #[test]
    fn test_parse_description_and_constraints() {
        let req = Request::from_json(
            r#"{"id":1,"call":{"method":"setRemoteDescription","pcId":4,"desc":{"type":"answer","sdp":"v=0"}}}"#,
        )
        .unwrap();
        match req.call {
            Call::SetRemoteDescription { desc, .. } => assert_eq!(desc.sdp_type, SdpType::Answer),
            other => panic!("unexpected call {:?}", other),
        }

        let req = Request::from_json(
            r#"{"id":2,"call":{"method":"getUserMedia","constraints":{"audio":true,"video":{"width":640}}}}"#,
        )
        .unwrap();
        match req.call {
            Call::GetUserMedia { constraints } => {
                assert_eq!(constraints.audio, Constraint::Enabled(true));
                assert!(constraints.video.requested());
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_keeps_callback_id() {
        let err = Request::from_json(r#"{"id":5,"call":{"method":"explode"}}"#).unwrap_err();
        assert_eq!(err.id, Some(5));
        assert!(Request::from_json("not json").unwrap_err().id.is_none());
    }

    #[test]
    fn test_host_message_shapes() {
        let json: Value = serde_json::from_str(&HostMessage::finished(4).to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["keep"], false);

        let json = serde_json::to_value(HostMessage::binary(4, b"\x00\x01")).unwrap();
        assert_eq!(json["status"], "binary");
        assert_eq!(json["data"], "AAE=");
        assert_eq!(decode_binary("AAE=").unwrap(), vec![0, 1]);

        let json = serde_json::to_value(HostMessage::error(4, "connection 1 does not exist")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["reason"], "connection 1 does not exist");
    }
}
