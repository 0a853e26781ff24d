/// Database row types. These map directly to SQLite rows and stay free of
/// the API models so the storage layer does not depend on wire formats.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub profile_picture: Option<String>,
    pub verified: bool,
    pub created_at: String,
}

/// Public profile columns, joined into chat listings.
#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub reply_to: Option<String>,
    pub chat_text: Option<String>,
    pub post_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub id: String,
    pub chat_id: String,
    pub file_name: String,
    pub media_type: String,
    pub size: i64,
    pub created_at: String,
}

/// Newest message of one conversation plus the partner's profile.
pub struct LatestChatRow {
    pub chat: ChatRow,
    pub partner: ProfileRow,
    pub unread_count: i64,
}
