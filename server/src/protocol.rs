use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Frame shared by every message on the socket (must match client protocol)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
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

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub action: SyncAction,
    pub current_time: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRoom {
    #[serde(default)]
    pub passcode: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRoom {
    pub room_id: String,
    #[serde(default)]
    pub passcode: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeSession {
    pub token: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Requests a client may send
#[derive(Debug, Clone)]
pub enum ClientRequest {
    CreateRoom(CreateRoom),
    JoinRoom(JoinRoom),
    ResumeSession(ResumeSession),
    LeaveRoom,
    VideoSync(SyncMessage),
    RequestSync,
}

impl ClientRequest {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Ok(Self::from_envelope(envelope)?)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { kind, data, .. } = envelope;
        let request = match kind.as_str() {
            "create_room" => Self::CreateRoom(decode(&kind, data)?),
            "join_room" => Self::JoinRoom(decode(&kind, data)?),
            "resume_session" => Self::ResumeSession(decode(&kind, data)?),
            "video_sync" => Self::VideoSync(decode(&kind, data)?),
            "leave_room" => Self::LeaveRoom,
            "request_sync" => Self::RequestSync,
            _ => return Err(ProtocolError::UnknownType(kind)),
        };
        Ok(request)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T, ProtocolError> {
    // A missing payload decodes like an empty object so optional-only payloads may omit it.
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberSummary {
    pub client_id: Uuid,
    pub display_name: String,
    pub is_host: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomJoined {
    pub room_id: String,
    pub client_id: Uuid,
    pub is_host: bool,
    pub passcode_enabled: bool,
    pub resume_token: String,
    pub capacity: usize,
    pub display_name: String,
}

/// Messages the server pushes to a client
#[derive(Debug, Clone)]
pub enum Outbound {
    RoomJoined(RoomJoined),
    RoomLeft,
    RoomNotFound,
    RoomFull {
        capacity: usize,
    },
    MemberUpdate {
        room_id: String,
        members: Vec<MemberSummary>,
        capacity: usize,
    },
    HostChanged {
        room_id: String,
        host_id: Uuid,
    },
    VideoSync {
        room_id: String,
        message: SyncMessage,
    },
    Error {
        message: String,
    },
}

impl Outbound {
    pub fn into_envelope(self) -> serde_json::Result<Envelope> {
        let (kind, data, room_id) = match self {
            Self::RoomJoined(joined) => {
                let room_id = joined.room_id.clone();
                ("room_joined", serde_json::to_value(&joined)?, Some(room_id))
            }
            Self::RoomLeft => ("room_left", Value::Null, None),
            Self::RoomNotFound => ("room_not_found", Value::Null, None),
            Self::RoomFull { capacity } => (
                "room_full",
                serde_json::json!({ "capacity": capacity }),
                None,
            ),
            Self::MemberUpdate {
                room_id,
                members,
                capacity,
            } => (
                "member_update",
                serde_json::json!({ "members": serde_json::to_value(&members)?, "capacity": capacity }),
                Some(room_id),
            ),
            Self::HostChanged { room_id, host_id } => (
                "host_changed",
                serde_json::json!({ "host_id": host_id }),
                Some(room_id),
            ),
            Self::VideoSync { room_id, message } => {
                ("video_sync", serde_json::to_value(message)?, Some(room_id))
            }
            Self::Error { message } => ("error", serde_json::json!({ "message": message }), None),
        };

        Ok(Envelope {
            kind: kind.to_string(),
            data,
            room_id,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let envelope = self.clone().into_envelope()?;
        serde_json::to_string(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_video_sync_envelope() {
        let text = r#"{"type":"video_sync","data":{"action":"play","current_time":120.0,"timestamp":1700000000000},"room_id":"123-456"}"#;
        match ClientRequest::parse(text).unwrap() {
            ClientRequest::VideoSync(msg) => {
                assert_eq!(msg.action, SyncAction::Play);
                assert_eq!(msg.current_time, 120.0);
                assert_eq!(msg.timestamp, 1_700_000_000_000);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn payloadless_requests_parse() {
        assert!(matches!(
            ClientRequest::parse(r#"{"type":"leave_room"}"#).unwrap(),
            ClientRequest::LeaveRoom
        ));
        match ClientRequest::parse(r#"{"type":"create_room"}"#).unwrap() {
            ClientRequest::CreateRoom(create) => assert!(create.passcode.is_none()),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(ClientRequest::parse(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientRequest::parse(r#"{"type":"video_sync","data":{"action":"rewind"}}"#).is_err());
    }

    #[test]
    fn video_sync_outbound_matches_wire_shape() {
        let json = Outbound::VideoSync {
            room_id: "123-456".into(),
            message: SyncMessage {
                action: SyncAction::Seek,
                current_time: 42.5,
                timestamp: 7,
            },
        }
        .to_json()
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "video_sync");
        assert_eq!(value["room_id"], "123-456");
        assert_eq!(value["data"]["action"], "seek");
        assert_eq!(value["data"]["current_time"], 42.5);
        assert_eq!(value["data"]["timestamp"], 7);
    }
}
