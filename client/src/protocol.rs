use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const VIDEO_SYNC: &str = "video_sync";

/// Frame shared by every message on the socket (must match server protocol)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: &str,
        payload: &T,
        room_id: Option<&str>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            data: serde_json::to_value(payload)?,
            room_id: room_id.map(str::to_string),
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Playback actions carried by `video_sync`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Play,
    Pause,
    Seek,
}

/// One host playback update. `timestamp` is wall-clock milliseconds and is never
/// used for latency compensation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub action: SyncAction,
    pub current_time: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub client_id: Uuid,
    pub display_name: String,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomJoined {
    pub room_id: String,
    pub client_id: Uuid,
    pub is_host: bool,
    pub passcode_enabled: bool,
    pub resume_token: String,
    pub capacity: usize,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct MemberUpdatePayload {
    members: Vec<MemberSummary>,
    capacity: usize,
}

#[derive(Debug, Deserialize)]
struct HostChangedPayload {
    host_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct RoomFullPayload {
    capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Server messages after normalization; the only place raw payloads are decoded
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    RoomJoined(RoomJoined),
    RoomLeft,
    RoomNotFound,
    RoomFull {
        capacity: usize,
    },
    MemberUpdate {
        room_id: Option<String>,
        members: Vec<MemberSummary>,
        capacity: usize,
    },
    HostChanged {
        room_id: Option<String>,
        host_id: Uuid,
    },
    VideoSync {
        room_id: Option<String>,
        message: SyncMessage,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind.as_str();
        let room_id = envelope.room_id.clone();
        let event = match kind {
            "room_joined" => Self::RoomJoined(decode(kind, &envelope.data)?),
            "room_left" => Self::RoomLeft,
            "room_not_found" => Self::RoomNotFound,
            "room_full" => {
                let payload: RoomFullPayload = decode(kind, &envelope.data)?;
                Self::RoomFull {
                    capacity: payload.capacity,
                }
            }
            "member_update" => {
                let payload: MemberUpdatePayload = decode(kind, &envelope.data)?;
                Self::MemberUpdate {
                    room_id,
                    members: payload.members,
                    capacity: payload.capacity,
                }
            }
            "host_changed" => {
                let payload: HostChangedPayload = decode(kind, &envelope.data)?;
                Self::HostChanged {
                    room_id,
                    host_id: payload.host_id,
                }
            }
            VIDEO_SYNC => Self::VideoSync {
                room_id,
                message: decode(kind, &envelope.data)?,
            },
            "error" => {
                let payload: ErrorPayload = decode(kind, &envelope.data)?;
                Self::Error {
                    message: payload.message,
                }
            }
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(event)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Requests sent to the relay, as `(type, payload)` pairs
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ClientRequest {
    CreateRoom {
        #[serde(skip_serializing_if = "Option::is_none")]
        passcode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        capacity: Option<usize>,
    },
    JoinRoom {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        passcode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    ResumeSession {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    LeaveRoom {},
    RequestSync {},
}

impl ClientRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "create_room",
            Self::JoinRoom { .. } => "join_room",
            Self::ResumeSession { .. } => "resume_session",
            Self::LeaveRoom {} => "leave_room",
            Self::RequestSync {} => "request_sync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_video_sync_wire_message() {
        let text = r#"{"type":"video_sync","data":{"action":"pause","current_time":61.25,"timestamp":1700000000123},"room_id":"123-456"}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(
            ServerEvent::from_envelope(&envelope).unwrap(),
            ServerEvent::VideoSync {
                room_id: Some("123-456".into()),
                message: SyncMessage {
                    action: SyncAction::Pause,
                    current_time: 61.25,
                    timestamp: 1_700_000_000_123,
                },
            }
        );
    }

    #[test]
    fn encodes_sync_envelope_with_room() {
        let message = SyncMessage {
            action: SyncAction::Play,
            current_time: 120.0,
            timestamp: 5,
        };
        let value = serde_json::to_value(Envelope::new(VIDEO_SYNC, &message, Some("1-2")).unwrap())
            .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "video_sync",
                "data": { "action": "play", "current_time": 120.0, "timestamp": 5 },
                "room_id": "1-2",
            })
        );
    }

    #[test]
    fn payloadless_events_decode() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"room_left"}"#).unwrap();
        assert_eq!(ServerEvent::from_envelope(&envelope).unwrap(), ServerEvent::RoomLeft);
    }

    #[test]
    fn unknown_types_are_reported() {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"chat","data":{}}"#).unwrap();
        assert!(matches!(
            ServerEvent::from_envelope(&envelope),
            Err(ProtocolError::UnknownType(kind)) if kind == "chat"
        ));
    }

    #[test]
    fn requests_serialize_as_plain_payloads() {
        let request = ClientRequest::JoinRoom {
            room_id: "123-456".into(),
            passcode: None,
            display_name: Some("Ana".into()),
        };
        assert_eq!(request.kind(), "join_room");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "room_id": "123-456", "display_name": "Ana" })
        );
        assert_eq!(
            serde_json::to_value(ClientRequest::LeaveRoom {}).unwrap(),
            json!({})
        );
    }
}
