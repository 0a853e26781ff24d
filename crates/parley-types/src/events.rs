use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UserMetadata;

/// Namespace for per-user room keys, keeps them apart from any other key space.
pub const USER_ROOM_PREFIX: &str = "user:";

/// Bus topic: a new account was registered and needs a verification email.
pub const USER_CREATED: &str = "user.created";

/// Bus topic: push a frame into a room through the hub.
pub const WS_SEND_PAYLOAD: &str = "ws.send.payload";

/// Room key for the given user.
pub fn user_room_key(user_id: Uuid) -> String {
    format!("{}{}", USER_ROOM_PREFIX, user_id)
}

/// Frame action. Unknown actions decode to `Unsupported` so the gateway can
/// answer them with an error frame instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Subscribe,
    PrivateMessage,
    System,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    Ok,
    Error,
}

/// A frame on the WebSocket, in either direction.
///
/// Client frames carry `{action, detail, data}`; server frames always add `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketEvent {
    pub action: Action,
    #[serde(default)]
    pub detail: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FrameType>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WebsocketEvent {
    pub fn ok(action: Action, detail: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            action,
            detail: detail.into(),
            kind: Some(FrameType::Ok),
            data,
        }
    }

    /// System error frame, routed only to the client that caused it.
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            action: Action::System,
            detail: detail.into(),
            kind: Some(FrameType::Error),
            data: serde_json::Value::Null,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `data` of a SUBSCRIBE frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomEventData {
    #[serde(default)]
    pub join_to: String,
}

impl JoinRoomEventData {
    pub fn is_valid(&self) -> bool {
        !self.join_to.trim().is_empty()
    }
}

/// `data` of a PRIVATE_MESSAGE frame sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateMessageRequest {
    pub to: Uuid,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media_url: Vec<String>,
}

impl PrivateMessageRequest {
    pub fn is_valid(&self) -> bool {
        let has_text = self.message.as_deref().is_some_and(|m| !m.is_empty());
        has_text || !self.media_url.is_empty()
    }
}

/// `data` of a PRIVATE_MESSAGE frame pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
    pub to: Uuid,
    pub message: Option<String>,
    pub media_url: Vec<String>,
    pub from: UserMetadata,
}

/// Payload of [`WS_SEND_PAYLOAD`]: a frame addressed to a room key.
#[derive(Debug, Clone)]
pub struct WsDelivery {
    pub receiver: String,
    pub event: WebsocketEvent,
}

/// Payload of [`USER_CREATED`].
#[derive(Debug, Clone)]
pub struct NewUserEvent {
    pub email: String,
    pub username: String,
    pub activation_link: String,
}
