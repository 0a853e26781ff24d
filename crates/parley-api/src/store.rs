use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_db::Database;
use parley_db::models::{AttachmentRow, ChatRow, ProfileRow};
use parley_types::models::{ChatAttachment, ChatMessage, MediaCategory, UserMetadata};

use crate::error::ChatError;

/// Latest message of one conversation, with the partner's profile.
#[derive(Debug, Clone)]
pub struct LatestChat {
    pub chat: ChatMessage,
    pub partner: UserMetadata,
    pub unread_count: i64,
}

/// Persistence the chat pipeline depends on.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Insert the message row and return the sender's public profile.
    /// `NotFound` when the receiver or the replied-to message does not exist;
    /// nothing is written in that case.
    async fn save_chat(&self, chat: &ChatMessage) -> Result<UserMetadata, ChatError>;

    /// Remove a message row without touching files. Used to undo `save_chat`.
    async fn remove_chat_row(&self, chat_id: Uuid) -> Result<()>;

    /// Insert all attachment rows or none.
    async fn save_attachments(&self, attachments: &[ChatAttachment]) -> Result<()>;

    async fn chats_between(&self, a: Uuid, b: Uuid) -> Result<Vec<ChatMessage>>;

    async fn latest_chats(&self, user: Uuid) -> Result<Vec<LatestChat>>;

    async fn chat_by_id(&self, chat_id: Uuid) -> Result<Option<ChatMessage>>;

    /// Delete a message and its attachment rows; returns the stored file
    /// names, or `None` if the message does not exist.
    async fn delete_chat(&self, chat_id: Uuid) -> Result<Option<Vec<String>>>;

    async fn mark_read(&self, reader: Uuid, partner: Uuid) -> Result<usize>;
}

/// [`ChatStore`] over the SQLite database. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Arc<Database>,
}

impl SqliteChatStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("spawn_blocking join error")?
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn save_chat(&self, chat: &ChatMessage) -> Result<UserMetadata, ChatError> {
        let row = ChatRow {
            id: chat.id.to_string(),
            sender_id: chat.sender_id.to_string(),
            receiver_id: chat.receiver_id.to_string(),
            reply_to: chat.reply_to.map(|id| id.to_string()),
            chat_text: chat.chat_text.clone(),
            post_id: chat.post_id.map(|id| id.to_string()),
            is_read: chat.is_read,
            created_at: format_time(chat.created_at),
        };
        let sender = chat.sender_id.to_string();
        let insert = self
            .blocking(move |db| {
                if db.get_profile(&row.receiver_id)?.is_none() {
                    return Ok(Insert::NoReceiver);
                }
                if let Some(reply_to) = &row.reply_to {
                    if db.get_chat_by_id(reply_to)?.is_none() {
                        return Ok(Insert::NoReplyTarget);
                    }
                }
                db.insert_chat(&row)?;
                Ok(Insert::Saved(db.get_profile(&sender)?))
            })
            .await?;

        match insert {
            Insert::NoReceiver => Err(ChatError::NotFound("receiver not found".into())),
            Insert::NoReplyTarget => Err(ChatError::NotFound("reply_to chat not found".into())),
            Insert::Saved(profile) => {
                let profile = profile.ok_or_else(|| anyhow!("sender {} has no profile", chat.sender_id))?;
                Ok(profile_to_metadata(profile)?)
            }
        }
    }

    async fn remove_chat_row(&self, chat_id: Uuid) -> Result<()> {
        let id = chat_id.to_string();
        self.blocking(move |db| db.delete_chat(&id)).await?;
        Ok(())
    }

    async fn save_attachments(&self, attachments: &[ChatAttachment]) -> Result<()> {
        let rows: Vec<AttachmentRow> = attachments
            .iter()
            .map(|a| AttachmentRow {
                id: a.id.to_string(),
                chat_id: a.chat_id.to_string(),
                file_name: a.file_name.clone(),
                media_type: a.media_type.as_str().to_string(),
                size: a.size,
                created_at: format_time(a.created_at),
            })
            .collect();
        self.blocking(move |db| db.insert_attachments(&rows)).await
    }

    async fn chats_between(&self, a: Uuid, b: Uuid) -> Result<Vec<ChatMessage>> {
        let (a, b) = (a.to_string(), b.to_string());
        let (rows, attachments) = self
            .blocking(move |db| {
                let rows = db.get_chat_between(&a, &b)?;
                let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
                let attachments = db.get_attachments_for_chats(&ids)?;
                Ok((rows, attachments))
            })
            .await?;
        assemble(rows, attachments)
    }

    async fn latest_chats(&self, user: Uuid) -> Result<Vec<LatestChat>> {
        let user = user.to_string();
        let (latest, attachments) = self
            .blocking(move |db| {
                let latest = db.get_latest_chats(&user)?;
                let ids: Vec<String> = latest.iter().map(|l| l.chat.id.clone()).collect();
                let attachments = db.get_attachments_for_chats(&ids)?;
                Ok((latest, attachments))
            })
            .await?;

        let mut by_chat = group_attachments(attachments)?;
        latest
            .into_iter()
            .map(|l| {
                let mut chat = chat_from_row(l.chat)?;
                chat.attachments = by_chat.remove(&chat.id).unwrap_or_default();
                Ok(LatestChat {
                    chat,
                    partner: profile_to_metadata(l.partner)?,
                    unread_count: l.unread_count,
                })
            })
            .collect()
    }

    async fn chat_by_id(&self, chat_id: Uuid) -> Result<Option<ChatMessage>> {
        let id = chat_id.to_string();
        let row = self.blocking(move |db| db.get_chat_by_id(&id)).await?;
        row.map(chat_from_row).transpose()
    }

    async fn delete_chat(&self, chat_id: Uuid) -> Result<Option<Vec<String>>> {
        let id = chat_id.to_string();
        self.blocking(move |db| db.delete_chat(&id)).await
    }

    async fn mark_read(&self, reader: Uuid, partner: Uuid) -> Result<usize> {
        let (reader, partner) = (reader.to_string(), partner.to_string());
        self.blocking(move |db| db.mark_read(&reader, &partner)).await
    }
}

/// Result of the checked insert in `save_chat`.
enum Insert {
    Saved(Option<ProfileRow>),
    NoReceiver,
    NoReplyTarget,
}

fn format_time(t: DateTime<Utc>) -> String {
    // Fixed width so text ordering in SQL is chronological.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {:?}", s))?
        .with_timezone(&Utc))
}

fn parse_id(s: &str) -> Result<Uuid> {
    s.parse().with_context(|| format!("bad id {:?}", s))
}

fn chat_from_row(row: ChatRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: parse_id(&row.id)?,
        sender_id: parse_id(&row.sender_id)?,
        receiver_id: parse_id(&row.receiver_id)?,
        reply_to: row.reply_to.as_deref().map(parse_id).transpose()?,
        chat_text: row.chat_text,
        post_id: row.post_id.as_deref().map(parse_id).transpose()?,
        is_read: row.is_read,
        created_at: parse_time(&row.created_at)?,
        attachments: vec![],
    })
}

fn attachment_from_row(row: AttachmentRow) -> Result<ChatAttachment> {
    Ok(ChatAttachment {
        id: parse_id(&row.id)?,
        chat_id: parse_id(&row.chat_id)?,
        media_type: MediaCategory::parse(&row.media_type)
            .ok_or_else(|| anyhow!("unknown media type {:?}", row.media_type))?,
        file_name: row.file_name,
        size: row.size,
        created_at: parse_time(&row.created_at)?,
    })
}

fn profile_to_metadata(p: ProfileRow) -> Result<UserMetadata> {
    Ok(UserMetadata {
        id: parse_id(&p.id)?,
        username: Some(p.username),
        full_name: Some(p.full_name),
        profile_picture: p.profile_picture,
    })
}

fn group_attachments(rows: Vec<AttachmentRow>) -> Result<HashMap<Uuid, Vec<ChatAttachment>>> {
    let mut map: HashMap<Uuid, Vec<ChatAttachment>> = HashMap::new();
    for row in rows {
        let att = attachment_from_row(row)?;
        map.entry(att.chat_id).or_default().push(att);
    }
    Ok(map)
}

fn assemble(rows: Vec<ChatRow>, attachments: Vec<AttachmentRow>) -> Result<Vec<ChatMessage>> {
    let mut by_chat = group_attachments(attachments)?;
    rows.into_iter()
        .map(|row| {
            let mut chat = chat_from_row(row)?;
            chat.attachments = by_chat.remove(&chat.id).unwrap_or_default();
            Ok(chat)
        })
        .collect()
}
