use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::models::{ChatAttachment, MediaCategory};

use crate::error::ChatError;
use crate::kv::{HashEntry, KeyValueStore};
use crate::probe::MediaProbe;
use crate::storage::MediaStorage;

pub const MEDIA_TOKEN_PREFIX: &str = "media_access:private_chat:";

/// Lifetime of a media grant, and the floor for video grants.
pub const DEFAULT_MEDIA_TTL: Duration = Duration::from_secs(5 * 60);

const TOKEN_BYTES: usize = 16;

/// 16 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn media_key(token: &str) -> String {
    format!("{}{}", MEDIA_TOKEN_PREFIX, token)
}

/// What a resolved token grants access to.
#[derive(Debug, Clone)]
pub struct MediaGrant {
    pub filename: String,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub media_type: MediaCategory,
}

/// Mints and resolves short-lived capabilities for private attachments.
pub struct MediaTokens {
    kv: Arc<dyn KeyValueStore>,
    probe: Arc<dyn MediaProbe>,
    storage: Arc<MediaStorage>,
}

impl MediaTokens {
    pub fn new(kv: Arc<dyn KeyValueStore>, probe: Arc<dyn MediaProbe>, storage: Arc<MediaStorage>) -> Self {
        Self { kv, probe, storage }
    }

    /// One token per attachment, in the same order, all written in one batch.
    pub async fn issue(
        &self,
        attachments: &[ChatAttachment],
        sender_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<Vec<String>, ChatError> {
        if attachments.is_empty() {
            return Ok(vec![]);
        }

        let mut tokens = Vec::with_capacity(attachments.len());
        let mut entries = Vec::with_capacity(attachments.len());
        for att in attachments {
            let token = generate_token();
            entries.push(HashEntry {
                key: media_key(&token),
                fields: vec![
                    ("filename".into(), att.file_name.clone()),
                    ("sender_id".into(), sender_id.to_string()),
                    ("receiver_id".into(), receiver_id.to_string()),
                    ("type".into(), att.media_type.as_str().into()),
                ],
                ttl: self.ttl_for(att).await,
            });
            tokens.push(token);
        }

        self.kv.set_hashes(entries).await?;
        debug!("Issued {} media tokens", tokens.len());
        Ok(tokens)
    }

    /// Grant behind `token`, provided `requester` is one of the two
    /// participants.
    pub async fn resolve(&self, token: &str, requester: Uuid) -> Result<MediaGrant, ChatError> {
        let fields = self
            .kv
            .get_hash(&media_key(token))
            .await?
            .ok_or_else(|| ChatError::NotFound("media token is invalid or expired".into()))?;

        let grant = parse_grant(&fields)
            .ok_or_else(|| ChatError::Persistence(anyhow::anyhow!("malformed media grant for token")))?;

        if grant.sender_id != requester && grant.receiver_id != requester {
            return Err(ChatError::Unauthorized("not a participant of this conversation".into()));
        }
        Ok(grant)
    }

    /// Videos stay reachable for as long as they play, never less than the
    /// default.
    async fn ttl_for(&self, att: &ChatAttachment) -> Duration {
        if att.media_type != MediaCategory::Video {
            return DEFAULT_MEDIA_TTL;
        }

        let path = match self.storage.path_of(&att.file_name) {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot probe {}: {}", att.file_name, e);
                return DEFAULT_MEDIA_TTL;
            }
        };
        match self.probe.duration(&path).await {
            Ok(d) => d.max(DEFAULT_MEDIA_TTL),
            Err(e) => {
                warn!("Video duration probe failed for {}: {:#}", att.file_name, e);
                DEFAULT_MEDIA_TTL
            }
        }
    }
}

fn parse_grant(fields: &std::collections::HashMap<String, String>) -> Option<MediaGrant> {
    Some(MediaGrant {
        filename: fields.get("filename")?.clone(),
        sender_id: fields.get("sender_id")?.parse().ok()?,
        receiver_id: fields.get("receiver_id")?.parse().ok()?,
        media_type: MediaCategory::parse(fields.get("type")?)?,
    })
}
