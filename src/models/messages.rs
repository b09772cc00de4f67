use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::crdt::{ActivityRecord, CursorPosition, CursorSelection, CursorState, FileAction, FileChange};
use crate::models::collaborator::{Collaborator, PresenceStatus};

/// First parse stage: the envelope only. Payload stays opaque until the
/// type is recognized, so a bad payload can be reported per type.
#[derive(Deserialize, Debug)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid '{type_}' payload: {source}")]
    BadPayload {
        type_: String,
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessage {
    pub token: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub project_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaveMessage {
    pub project_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorMessage {
    pub project_id: String,
    pub position: CursorPosition,
    #[serde(default)]
    pub selection: Option<CursorSelection>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileMessage {
    pub project_id: String,
    pub action: FileAction,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub new_path: Option<String>,
}

impl FileMessage {
    pub fn to_change(&self) -> FileChange {
        FileChange {
            action: self.action,
            path: self.path.clone(),
            content: self.content.clone(),
            new_path: self.new_path.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMessage {
    pub project_id: String,
    pub action: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HeartbeatMessage {}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub status: PresenceStatus,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub current_page: Option<String>,
}

/// Messages accepted from clients.
#[derive(Debug, Clone)]
pub enum ReceivedMessage {
    Auth(AuthMessage),
    Join(JoinMessage),
    Leave(LeaveMessage),
    Cursor(CursorMessage),
    File(FileMessage),
    Activity(ActivityMessage),
    Status(StatusMessage),
    Heartbeat(HeartbeatMessage),
}

impl ReceivedMessage {
    /// Two-stage parse of an inbound text frame: envelope first, then the
    /// typed payload for a recognized type.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope = serde_json::from_str(text)?;
        let mut data = envelope.data;
        if data.is_null() {
            data = Value::Object(serde_json::Map::new());
        }
        let parsed = match envelope.type_.as_str() {
            "auth" => Self::Auth(payload(&envelope.type_, data)?),
            "join" => Self::Join(payload(&envelope.type_, data)?),
            "leave" => Self::Leave(payload(&envelope.type_, data)?),
            "cursor" => Self::Cursor(payload(&envelope.type_, data)?),
            "file" => Self::File(payload(&envelope.type_, data)?),
            "activity" => Self::Activity(payload(&envelope.type_, data)?),
            "status" => Self::Status(payload(&envelope.type_, data)?),
            "heartbeat" => Self::Heartbeat(payload(&envelope.type_, data)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(parsed)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Cursor(_) => "cursor",
            Self::File(_) => "file",
            Self::Activity(_) => "activity",
            Self::Status(_) => "status",
            Self::Heartbeat(_) => "heartbeat",
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(type_: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::BadPayload {
        type_: type_.to_string(),
        source,
    })
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bootstrap payload sent to the joining session only: the current file
/// contents, who is here and the recent activity tail.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMessage {
    pub project_id: String,
    pub success: bool,
    pub collaborators: Vec<Collaborator>,
    pub files: BTreeMap<String, String>,
    pub activity: Vec<ActivityRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceJoinMessage {
    pub project_id: String,
    pub collaborator: Collaborator,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeaveMessage {
    pub project_id: String,
    pub session_id: Uuid,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdateMessage {
    pub project_id: String,
    pub collaborator: Collaborator,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorMoveMessage {
    pub project_id: String,
    pub cursor: CursorState,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeMessage {
    pub project_id: String,
    pub action: FileAction,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    pub session_id: Uuid,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBroadcast {
    pub project_id: String,
    pub record: ActivityRecord,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

/// Messages the server emits, as `{"type": ..., "data": ...}` frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SendMessage {
    Auth(AuthAck),
    Joined(JoinedMessage),
    PresenceJoin(PresenceJoinMessage),
    PresenceLeave(PresenceLeaveMessage),
    PresenceUpdate(PresenceUpdateMessage),
    CursorMove(CursorMoveMessage),
    FileChange(FileChangeMessage),
    Activity(ActivityBroadcast),
    Error(ErrorMessage),
}

/// What fans out on a room's broadcast channel. Receivers drop frames whose
/// `sender_id` matches their own session.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub sender_id: Uuid,
    pub message: SendMessage,
}
