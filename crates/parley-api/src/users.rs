use anyhow::Context;
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};

use parley_db::models::UserRow;
use parley_types::api::{ApiResponse, Claims};
use parley_types::models::User;

use crate::auth::internal;
use crate::state::AppState;

/// Profile of the authenticated user.
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let row = state
        .db
        .get_user_by_id(&claims.sub.to_string())
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let user = user_from_row(row).map_err(internal)?;
    Ok(Json(ApiResponse::ok(user)))
}

/// Everything but the password hash.
fn user_from_row(row: UserRow) -> anyhow::Result<User> {
    Ok(User {
        id: row.id.parse().with_context(|| format!("bad user id {:?}", row.id))?,
        username: row.username,
        full_name: row.full_name,
        email: row.email,
        profile_picture: row.profile_picture,
        verified: row.verified,
        created_at: DateTime::parse_from_rfc3339(&row.created_at)
            .with_context(|| format!("bad timestamp {:?}", row.created_at))?
            .with_timezone(&Utc),
    })
}
