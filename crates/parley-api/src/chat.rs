use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, Request, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::error;

use parley_types::api::{ApiResponse, Claims, MarkReadResponse};

use crate::error::ChatError;
use crate::service::ChatPostInput;
use crate::state::AppState;

/// Largest accepted attachment.
pub const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

/// Attachments allowed in one post. Bounds the request body together with
/// [`MAX_FILE_SIZE`].
pub const MAX_FILES_PER_CHAT: usize = 10;

/// Multipart framing on top of the attachment bytes.
const FORM_OVERHEAD: usize = 1024 * 1024;

/// Largest accepted post body.
pub const MAX_BODY_SIZE: usize = MAX_FILE_SIZE * MAX_FILES_PER_CHAT + FORM_OVERHEAD;

pub async fn post_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ChatError> {
    let mut input = ChatPostInput {
        sender_id: claims.sub,
        ..Default::default()
    };

    while let Some(mut field) = multipart.next_field().await.map_err(bad_form)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "receiver_id" => input.receiver_id = field.text().await.map_err(bad_form)?,
            "reply_to" => input.reply_to = Some(field.text().await.map_err(bad_form)?),
            "chat_text" => input.chat_text = Some(field.text().await.map_err(bad_form)?),
            "posts_id" => input.post_id = Some(field.text().await.map_err(bad_form)?),
            "chat_media" => {
                if input.media.len() == MAX_FILES_PER_CHAT {
                    return Err(ChatError::Validation(format!(
                        "at most {} attachments per chat",
                        MAX_FILES_PER_CHAT
                    )));
                }
                let mut buf = BytesMut::new();
                while let Some(chunk) = field.chunk().await.map_err(bad_form)? {
                    if buf.len() + chunk.len() > MAX_FILE_SIZE {
                        return Err(ChatError::PayloadTooLarge(format!(
                            "attachment exceeds {} bytes",
                            MAX_FILE_SIZE
                        )));
                    }
                    buf.extend_from_slice(&chunk);
                }
                input.media.push(buf.freeze());
            }
            _ => {}
        }
    }

    // Once the row is written the save runs to completion even if the
    // client goes away.
    let saved = tokio::spawn(async move { state.chat.save_chat(input).await })
        .await
        .map_err(|e| {
            error!("Chat save task failed: {}", e);
            ChatError::Persistence(anyhow::anyhow!("chat save task failed"))
        })??;

    Ok(Json(ApiResponse::ok(saved.to_response())))
}

pub async fn get_chat_between(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(receiver): Path<String>,
) -> Result<impl IntoResponse, ChatError> {
    let chats = state.chat.get_chat_between(claims.sub, &receiver).await?;
    Ok(Json(ApiResponse::ok(chats)))
}

pub async fn get_latest_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ChatError> {
    let latest = state.chat.get_latest_chat(claims.sub).await?;
    Ok(Json(ApiResponse::ok(latest)))
}

pub async fn delete_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<String>,
) -> Result<impl IntoResponse, ChatError> {
    state.chat.delete_chat(claims.sub, &chat_id).await?;
    Ok(Json(ApiResponse::ok(())))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(partner): Path<String>,
) -> Result<impl IntoResponse, ChatError> {
    let updated = state.chat.mark_conversation_read(claims.sub, &partner).await?;
    Ok(Json(ApiResponse::ok(MarkReadResponse { updated })))
}

/// Stream a private attachment to a participant holding a live token.
pub async fn get_attachment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(token): Path<String>,
    req: Request,
) -> Result<Response, ChatError> {
    let path = state.chat.get_private_attachment_file(&token, claims.sub).await?;
    match ServeFile::new(path).oneshot(req).await {
        Ok(res) => Ok(res.map(Body::new)),
        Err(never) => match never {},
    }
}

/// A body cut off by the request size limit is a 413, anything else a 400.
fn bad_form(e: MultipartError) -> ChatError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ChatError::PayloadTooLarge(e.body_text())
    } else {
        ChatError::Validation(e.body_text())
    }
}
