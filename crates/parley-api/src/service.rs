use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_events::{EventBus, EventPayload};
use parley_types::api::{ChatResponseData, LatestChatData};
use parley_types::events::{Action, PrivateMessageData, WS_SEND_PAYLOAD, WebsocketEvent, WsDelivery, user_room_key};
use parley_types::models::{ChatAttachment, ChatMessage, UserMetadata};

use crate::error::ChatError;
use crate::media::MediaTokens;
use crate::storage::{MediaKind, MediaStorage, classify};
use crate::store::ChatStore;

pub const NEW_MESSAGE_DETAIL: &str = "NEW MESSAGE ARRIVED";
pub const DELIVERED_DETAIL: &str = "MESSAGE SUCCESSFULLY DELIVERED";

/// A "post a chat" request as it arrives from the form, ids still unparsed.
#[derive(Debug, Default)]
pub struct ChatPostInput {
    pub sender_id: Uuid,
    pub receiver_id: String,
    pub reply_to: Option<String>,
    pub chat_text: Option<String>,
    pub post_id: Option<String>,
    pub media: Vec<Bytes>,
}

#[derive(Debug, Clone)]
pub struct SavedChat {
    pub chat: ChatMessage,
    pub sender: UserMetadata,
    /// One per attachment, same order.
    pub media_tokens: Vec<String>,
}

impl SavedChat {
    pub fn to_response(&self) -> ChatResponseData {
        chat_response(&self.chat, self.chat.sender_id, self.media_tokens.clone())
    }
}

/// The chat pipeline and the read side of conversations.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
    storage: Arc<MediaStorage>,
    tokens: MediaTokens,
    bus: EventBus,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>, storage: Arc<MediaStorage>, tokens: MediaTokens, bus: EventBus) -> Self {
        Self {
            store,
            storage,
            tokens,
            bus,
        }
    }

    /// Validate, persist, store attachments, mint tokens and publish the
    /// delivery frames. Nothing is written unless validation passes, and a
    /// failure while storing attachments leaves nothing behind.
    pub async fn save_chat(&self, input: ChatPostInput) -> Result<SavedChat, ChatError> {
        let chat_text = non_blank(input.chat_text);
        let post_id = non_blank(input.post_id);
        if chat_text.is_none() && input.media.is_empty() && post_id.is_none() {
            return Err(ChatError::Validation(
                "chat must contain text, media or a linked post".into(),
            ));
        }

        let receiver_id = parse_id("receiver_id", &input.receiver_id)?;
        let reply_to = non_blank(input.reply_to)
            .map(|s| parse_id("reply_to", &s))
            .transpose()?;
        let post_id = post_id.map(|s| parse_id("posts_id", &s)).transpose()?;

        let kinds = input
            .media
            .iter()
            .map(|data| classify(data).map_err(|mime| ChatError::UnsupportedMedia(mime.to_string())))
            .collect::<Result<Vec<MediaKind>, ChatError>>()?;

        let mut chat = ChatMessage {
            id: Uuid::new_v4(),
            sender_id: input.sender_id,
            receiver_id,
            reply_to,
            chat_text,
            post_id,
            is_read: false,
            created_at: Utc::now(),
            attachments: vec![],
        };

        let sender = self.store.save_chat(&chat).await?;

        chat.attachments = match self.store_media(&chat, &input.media, &kinds).await {
            Ok(attachments) => attachments,
            Err(e) => {
                if let Err(undo) = self.store.remove_chat_row(chat.id).await {
                    error!("Failed to roll back chat {}: {:#}", chat.id, undo);
                }
                return Err(e);
            }
        };

        let media_tokens = self
            .tokens
            .issue(&chat.attachments, chat.sender_id, chat.receiver_id)
            .await?;

        self.publish_delivery(&chat, &sender, &media_tokens);
        info!(
            "Chat {} saved: {} -> {} ({} attachments)",
            chat.id,
            chat.sender_id,
            chat.receiver_id,
            chat.attachments.len()
        );

        Ok(SavedChat {
            chat,
            sender,
            media_tokens,
        })
    }

    async fn store_media(
        &self,
        chat: &ChatMessage,
        media: &[Bytes],
        kinds: &[MediaKind],
    ) -> Result<Vec<ChatAttachment>, ChatError> {
        let mut stored: Vec<String> = Vec::with_capacity(media.len());
        let mut attachments = Vec::with_capacity(media.len());

        for (data, kind) in media.iter().zip(kinds) {
            let name = match self.storage.save(data, kind.ext).await {
                Ok(name) => name,
                Err(e) => {
                    self.storage.delete_all(&stored).await;
                    return Err(ChatError::Persistence(e.into()));
                }
            };
            stored.push(name.clone());
            attachments.push(ChatAttachment {
                id: Uuid::new_v4(),
                chat_id: chat.id,
                file_name: name,
                media_type: kind.category,
                size: data.len() as i64,
                created_at: chat.created_at,
            });
        }

        if attachments.is_empty() {
            return Ok(attachments);
        }
        if let Err(e) = self.store.save_attachments(&attachments).await {
            self.storage.delete_all(&stored).await;
            return Err(e.into());
        }
        Ok(attachments)
    }

    fn publish_delivery(&self, chat: &ChatMessage, sender: &UserMetadata, tokens: &[String]) {
        let data = PrivateMessageData {
            chat_id: Some(chat.id),
            to: chat.receiver_id,
            message: chat.chat_text.clone(),
            media_url: tokens.to_vec(),
            from: sender.clone(),
        };
        let data = match serde_json::to_value(&data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to encode delivery for chat {}: {}", chat.id, e);
                return;
            }
        };

        let targets = [
            (chat.receiver_id, NEW_MESSAGE_DETAIL),
            (chat.sender_id, DELIVERED_DETAIL),
        ];
        for (user, detail) in targets {
            let delivery = WsDelivery {
                receiver: user_room_key(user),
                event: WebsocketEvent::ok(Action::PrivateMessage, detail, data.clone()),
            };
            self.bus.publish(WS_SEND_PAYLOAD, EventPayload::SendPayload(delivery));
        }
    }

    /// Whole conversation between `requester` and `partner`, oldest first,
    /// with fresh media tokens.
    pub async fn get_chat_between(
        &self,
        requester: Uuid,
        partner: &str,
    ) -> Result<Vec<ChatResponseData>, ChatError> {
        let partner = parse_id("receiver_id", partner)?;
        let chats = self.store.chats_between(requester, partner).await?;

        let mut out = Vec::with_capacity(chats.len());
        for chat in &chats {
            let tokens = self
                .tokens
                .issue(&chat.attachments, chat.sender_id, chat.receiver_id)
                .await?;
            out.push(chat_response(chat, requester, tokens));
        }
        debug!("Loaded {} chats between {} and {}", out.len(), requester, partner);
        Ok(out)
    }

    /// Most recent message of every conversation `user` takes part in.
    pub async fn get_latest_chat(&self, user: Uuid) -> Result<Vec<LatestChatData>, ChatError> {
        let latest = self.store.latest_chats(user).await?;

        let mut out = Vec::with_capacity(latest.len());
        for entry in latest {
            let tokens = self
                .tokens
                .issue(&entry.chat.attachments, entry.chat.sender_id, entry.chat.receiver_id)
                .await?;
            out.push(LatestChatData {
                chat_data: chat_response(&entry.chat, user, tokens),
                partner_id: entry.partner.id,
                partner_fullname: entry.partner.full_name.unwrap_or_default(),
                partner_username: entry.partner.username.unwrap_or_default(),
                partner_profile_picture: entry.partner.profile_picture,
                unread_count: entry.unread_count,
            });
        }
        Ok(out)
    }

    /// Only the sender may delete. Attachment rows go with the message and
    /// their files are removed afterwards.
    pub async fn delete_chat(&self, user: Uuid, chat_id: &str) -> Result<(), ChatError> {
        let chat_id = parse_id("chat_id", chat_id)?;
        let chat = self
            .store
            .chat_by_id(chat_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("chat not found".into()))?;

        if chat.sender_id != user {
            return Err(ChatError::Unauthorized("only the sender can delete a chat".into()));
        }

        let files = self
            .store
            .delete_chat(chat_id)
            .await?
            .ok_or_else(|| ChatError::NotFound("chat not found".into()))?;
        self.storage.delete_all(&files).await;

        info!("Chat {} deleted by {} ({} files)", chat_id, user, files.len());
        Ok(())
    }

    /// Path of the file behind a media token, for a participant of the chat.
    pub async fn get_private_attachment_file(&self, token: &str, requester: Uuid) -> Result<PathBuf, ChatError> {
        let grant = self.tokens.resolve(token, requester).await?;
        self.storage
            .path_of(&grant.filename)
            .map_err(|e| ChatError::Persistence(e.into()))
    }

    /// Mark every message `partner` sent to `reader` as read.
    pub async fn mark_conversation_read(&self, reader: Uuid, partner: &str) -> Result<usize, ChatError> {
        let partner = parse_id("partner_id", partner)?;
        let updated = self.store.mark_read(reader, partner).await?;
        debug!("{} messages from {} marked read by {}", updated, partner, reader);
        Ok(updated)
    }
}

fn chat_response(chat: &ChatMessage, requester: Uuid, attachment_access: Vec<String>) -> ChatResponseData {
    ChatResponseData {
        id: chat.id,
        sender_id: chat.sender_id,
        receiver_id: chat.receiver_id,
        reply_to: chat.reply_to,
        chat_text: chat.chat_text.clone(),
        post_id: chat.post_id,
        is_read: chat.is_read,
        created_at: chat.created_at,
        is_own_message: chat.sender_id == requester,
        attachment_access,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn parse_id(field: &str, raw: &str) -> Result<Uuid, ChatError> {
    raw.trim()
        .parse()
        .map_err(|_| ChatError::Validation(format!("{} is not a valid id", field)))
}
