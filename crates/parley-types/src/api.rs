use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub user_id: Uuid,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

/// Body of `/auth/refresh-session`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub user_id: Uuid,
    pub token: String,
}

// -- Envelopes --

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            message: "ok".into(),
            data,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

// -- Chat --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponseData {
    #[serde(rename = "chat_id")]
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub reply_to: Option<Uuid>,
    pub chat_text: Option<String>,
    pub post_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    pub is_own_message: bool,
    /// One freshly minted media token per attachment.
    pub attachment_access: Vec<String>,
}

/// Most recent message of one conversation plus who it is with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestChatData {
    pub chat_data: ChatResponseData,
    pub partner_id: Uuid,
    pub partner_fullname: String,
    pub partner_username: String,
    pub partner_profile_picture: Option<String>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}
