//! Signaling wire format
//!
//! Requests: `{"id": 7, "method": "join-room", "data": {...}}`
//! Responses: `{"id": 7, "ok": true, "data": ...}` or
//! `{"id": 7, "ok": false, "error": "Room not found"}`
//! Notifications: `{"notification": "new-producer", "data": {...}}`

use camcast_sfu::{
    ConsumerId, MediaKind, PeerRole, ProducerId, RoomId, RoomNotification, RtpCapabilities,
    RtpParameters, TransportDirection, TransportId,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: RoomId,
    pub role: PeerRole,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransport {
    pub room_id: RoomId,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumer {
    pub room_id: RoomId,
    pub consumer_id: ConsumerId,
}

/// Payload of `start-recording` and `stop-recording`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRequest {
    pub room_id: RoomId,
}

#[derive(Debug, Clone)]
pub enum Request {
    JoinRoom(JoinRoom),
    CreateTransport(CreateTransport),
    ConnectTransport(ConnectTransport),
    Produce(Produce),
    Consume(Consume),
    ResumeConsumer(ResumeConsumer),
    StartRecording(RecordingRequest),
    StopRecording(RecordingRequest),
}

impl Request {
    /// Wire name of the method
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join-room",
            Self::CreateTransport(_) => "create-transport",
            Self::ConnectTransport(_) => "connect-transport",
            Self::Produce(_) => "produce",
            Self::Consume(_) => "consume",
            Self::ResumeConsumer(_) => "resume-consumer",
            Self::StartRecording(_) => "start-recording",
            Self::StopRecording(_) => "stop-recording",
        }
    }

    /// Room named in the payload
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom(r) => &r.room_id,
            Self::CreateTransport(r) => &r.room_id,
            Self::ConnectTransport(r) => &r.room_id,
            Self::Produce(r) => &r.room_id,
            Self::Consume(r) => &r.room_id,
            Self::ResumeConsumer(r) => &r.room_id,
            Self::StartRecording(r) | Self::StopRecording(r) => &r.room_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    id: u64,
    method: String,
    #[serde(default)]
    data: Value,
}

/// A request with its correlation id
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub id: u64,
    pub request: Request,
}

/// A frame that could not be turned into a request
#[derive(Debug)]
pub struct DecodeError {
    /// Correlation id if it could be recovered, 0 otherwise
    pub id: u64,
    pub error: SignalError,
}

impl ClientRequest {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawRequest = serde_json::from_str(text).map_err(|e| DecodeError {
            id: recover_id(text),
            error: SignalError::Malformed(e.to_string()),
        })?;

        let id = raw.id;
        let malformed = |e: serde_json::Error| DecodeError {
            id,
            error: SignalError::Malformed(e.to_string()),
        };
        let request = match raw.method.as_str() {
            "join-room" => Request::JoinRoom(payload(raw.data).map_err(malformed)?),
            "create-transport" => Request::CreateTransport(payload(raw.data).map_err(malformed)?),
            "connect-transport" => Request::ConnectTransport(payload(raw.data).map_err(malformed)?),
            "produce" => Request::Produce(payload(raw.data).map_err(malformed)?),
            "consume" => Request::Consume(payload(raw.data).map_err(malformed)?),
            "resume-consumer" => Request::ResumeConsumer(payload(raw.data).map_err(malformed)?),
            "start-recording" => Request::StartRecording(payload(raw.data).map_err(malformed)?),
            "stop-recording" => Request::StopRecording(payload(raw.data).map_err(malformed)?),
            other => {
                return Err(DecodeError {
                    id,
                    error: SignalError::UnknownMethod(other.to_string()),
                })
            }
        };
        Ok(Self { id, request })
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}

fn recover_id(text: &str) -> u64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_u64))
        .unwrap_or(0)
}

/// Producer present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomReply {
    pub rtp_capabilities: RtpCapabilities,
    /// Producers already publishing, so late viewers can consume right away
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProduceReply {
    pub id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeReply {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// `create-transport` reply: the id next to the engine's connection parameters
#[must_use]
pub fn transport_reply(id: &TransportId, parameters: Value) -> Value {
    match parameters {
        Value::Object(mut map) => {
            map.insert("id".to_string(), Value::String(id.as_str().to_string()));
            Value::Object(map)
        }
        other => serde_json::json!({ "id": id, "parameters": other }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    #[must_use]
    pub const fn success(id: u64, data: Option<Value>) -> Self {
        Self {
            id,
            ok: true,
            data,
            error: None,
        }
    }

    #[must_use]
    pub const fn failure(id: u64, error: String) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "notification", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    NewProducer(ProducerInfo),
}

impl From<RoomNotification> for Notification {
    fn from(notification: RoomNotification) -> Self {
        match notification {
            RoomNotification::NewProducer { producer_id, kind } => {
                Self::NewProducer(ProducerInfo { producer_id, kind })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to encode server message: {e}"))
    }
}

impl From<Response> for ServerMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<RoomNotification> for ServerMessage {
    fn from(notification: RoomNotification) -> Self {
        Self::Notification(notification.into())
    }
}
