mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_api::auth::decode_token;
use parley_api::media::MediaTokens;
use parley_api::probe::FfprobeProbe;
use parley_api::storage::MediaStorage;
use parley_api::store::SqliteChatStore;
use parley_api::{AppState, AppStateInner, ChatService};
use parley_events::{EventBus, LogMailer, MailSender, SmtpMailer, register_default_handlers};
use parley_gateway::Hub;
use parley_gateway::client::MAX_MESSAGE_SIZE;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(parley_db::Database::open(&config.db_path)?);
    let kv = parley_api::kv::connect(config.redis_url.as_deref()).await;
    let storage = Arc::new(MediaStorage::new(&config.upload_dir).await?);

    let mailer: Arc<dyn MailSender> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(&smtp.host, &smtp.user, &smtp.password)?),
        None => {
            warn!("SMTP not configured, verification mails are only logged");
            Arc::new(LogMailer)
        }
    };

    let hub = Hub::new();
    let bus = EventBus::current();
    register_default_handlers(&bus, hub.clone(), mailer);

    let tokens = MediaTokens::new(kv.clone(), Arc::new(FfprobeProbe::new(&config.ffprobe)), storage.clone());
    let chat = ChatService::new(Arc::new(SqliteChatStore::new(db.clone())), storage, tokens, bus.clone());

    let state: AppState = Arc::new(AppStateInner {
        db,
        chat,
        kv,
        bus,
        hub,
        jwt_secret: config.jwt_secret.clone(),
        public_url: config.public_url.clone(),
    });

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state.clone());

    let app = Router::new()
        .merge(parley_api::router(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parley server stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Authenticate, then hand the socket to the gateway. The token comes from
/// `?token=` (browsers cannot set headers on a WebSocket) or a bearer header.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query
        .token
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_string()));
    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match decode_token(&state.jwt_secret, &token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("WebSocket upgrade rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let hub = state.hub.clone();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            parley_gateway::serve(sink, stream, hub, claims.sub).await;
        })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
