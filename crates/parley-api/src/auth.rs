use std::time::Duration;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{AppendHeaders, IntoResponse},
};
use axum_extra::{TypedHeader, headers::Cookie};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::models::UserRow;
use parley_events::EventPayload;
use parley_types::api::{
    AccessTokenResponse, ApiResponse, Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
    VerifyResponse,
};
use parley_types::events::{NewUserEvent, USER_CREATED};

use crate::kv::HashEntry;
use crate::media::generate_token;
use crate::state::AppState;

const VERIFICATION_PREFIX: &str = "verification:";
const VERIFICATION_TTL: Duration = Duration::from_secs(15 * 60);
const SESSION_PREFIX: &str = "session:";
const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cookie carrying the refresh session handed out at login.
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Access tokens are short-lived; `/auth/refresh-session` mints new ones.
const ACCESS_TOKEN_LIFETIME_MINUTES: i64 = 15;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.full_name.trim().is_empty() || !req.email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }

    if state
        .db
        .user_exists(&req.username, &req.email)
        .map_err(internal)?
    {
        return Err(StatusCode::CONFLICT);
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .to_string();

    let user_id = Uuid::new_v4();
    state
        .db
        .create_user(&UserRow {
            id: user_id.to_string(),
            username: req.username.clone(),
            full_name: req.full_name.trim().to_string(),
            email: req.email.clone(),
            password: password_hash,
            profile_picture: None,
            verified: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
        .map_err(internal)?;

    let token = generate_token();
    state
        .kv
        .set_hashes(vec![HashEntry {
            key: format!("{}{}", VERIFICATION_PREFIX, token),
            fields: vec![("user_id".into(), user_id.to_string())],
            ttl: VERIFICATION_TTL,
        }])
        .await
        .map_err(internal)?;

    state.bus.publish(
        USER_CREATED,
        EventPayload::UserCreated(NewUserEvent {
            email: req.email,
            username: req.username.clone(),
            activation_link: format!("{}/auth/verify/{}", state.public_url.trim_end_matches('/'), token),
        }),
    );

    info!("User {} registered as {}", req.username, user_id);
    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id })))
}

pub async fn verify(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let key = format!("{}{}", VERIFICATION_PREFIX, token);
    let fields = state
        .kv
        .get_hash(&key)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let user_id: Uuid = fields
        .get("user_id")
        .and_then(|id| id.parse().ok())
        .ok_or(StatusCode::NOT_FOUND)?;

    if !state.db.mark_verified(&user_id.to_string()).map_err(internal)? {
        return Err(StatusCode::NOT_FOUND);
    }
    if let Err(e) = state.kv.delete(&key).await {
        warn!("Failed to drop used verification token: {:#}", e);
    }

    info!("User {} verified", user_id);
    Ok(Json(ApiResponse::ok(VerifyResponse {
        user_id,
        verified: true,
    })))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let user = state
        .db
        .get_user_by_username(&req.username)
        .map_err(internal)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let parsed_hash = PasswordHash::new(&user.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if !user.verified {
        return Err(StatusCode::FORBIDDEN);
    }

    let user_id: Uuid = user.id.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let token = create_token(&state.jwt_secret, user_id, &user.username).map_err(internal)?;

    let session = generate_token();
    state
        .kv
        .set_hashes(vec![HashEntry {
            key: format!("{}{}", SESSION_PREFIX, session),
            fields: vec![("user_id".into(), user_id.to_string())],
            ttl: SESSION_TTL,
        }])
        .await
        .map_err(internal)?;

    info!("User {} logged in", user.username);
    Ok((
        AppendHeaders([(header::SET_COOKIE, session_cookie(&session))]),
        Json(LoginResponse {
            user_id,
            username: user.username,
            token,
        }),
    ))
}

/// Trade the refresh cookie for a new access token.
pub async fn refresh_session(
    State(state): State<AppState>,
    cookies: Option<TypedHeader<Cookie>>,
) -> Result<impl IntoResponse, StatusCode> {
    let session = cookies
        .as_ref()
        .and_then(|TypedHeader(c)| c.get(REFRESH_COOKIE))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let fields = state
        .kv
        .get_hash(&format!("{}{}", SESSION_PREFIX, session))
        .await
        .map_err(internal)?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let user_id: Uuid = fields
        .get("user_id")
        .and_then(|id| id.parse().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // The username in the new token comes from the current row.
    let user = state
        .db
        .get_user_by_id(&user_id.to_string())
        .map_err(internal)?
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let token = create_token(&state.jwt_secret, user_id, &user.username).map_err(internal)?;

    Ok(Json(AccessTokenResponse { user_id, token }))
}

fn session_cookie(session: &str) -> String {
    format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; Secure; SameSite=Strict",
        REFRESH_COOKIE,
        session,
        SESSION_TTL.as_secs()
    )
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::minutes(ACCESS_TOKEN_LIFETIME_MINUTES)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

pub(crate) fn internal(e: anyhow::Error) -> StatusCode {
    error!("Auth storage error: {:#}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
