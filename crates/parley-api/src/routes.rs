use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
};
use serde_json::{Value, json};

use crate::auth;
use crate::chat::{self, MAX_BODY_SIZE};
use crate::middleware::require_auth;
use crate::state::AppState;
use crate::users;

/// HTTP routes of the API. The WebSocket upgrade and the outer layers are
/// added by the server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/verify/{token}", get(auth::verify))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh-session", get(auth::refresh_session));

    let protected_routes = Router::new()
        .route("/user/me", get(users::me))
        .route("/chat/post-message", post(chat::post_message))
        .route("/chat/between/{receiver}", get(chat::get_chat_between))
        .route("/chat/attachment/{token}", get(chat::get_attachment))
        .route("/chat/latest", get(chat::get_latest_chat))
        .route("/chat/delete/{chat_id}", delete(chat::delete_chat))
        .route("/chat/read/{partner}", patch(chat::mark_read))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
