use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use parley_api::kv::{KeyValueStore, MemoryStore};
use parley_api::media::MediaTokens;
use parley_api::probe::FfprobeProbe;
use parley_api::storage::MediaStorage;
use parley_api::store::SqliteChatStore;
use parley_api::chat::MAX_BODY_SIZE;
use parley_api::{AppStateInner, ChatService, router};
use parley_db::Database;
use parley_events::{EventBus, MailSender, OutgoingMail, register_default_handlers};
use parley_gateway::{Hub, Member, Payload};
use parley_types::events::user_room_key;

type TestResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01";
const BOUNDARY: &str = "parley-test-boundary";

struct RecordingMailer(mpsc::UnboundedSender<OutgoingMail>);

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        let _ = self.0.send(mail);
        Ok(())
    }
}

struct TestApp {
    app: Router,
    hub: Hub,
    mail: mpsc::UnboundedReceiver<OutgoingMail>,
    _tmp: tempfile::TempDir,
}

impl TestApp {
    async fn new() -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let db = Arc::new(Database::open_in_memory()?);
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let storage = Arc::new(MediaStorage::new(tmp.path()).await?);
        let tokens = MediaTokens::new(
            kv.clone(),
            Arc::new(FfprobeProbe::new("parley-test-missing-ffprobe")),
            storage.clone(),
        );

        let bus = EventBus::current();
        let hub = Hub::new();
        let (tx, mail) = mpsc::unbounded_channel();
        register_default_handlers(&bus, hub.clone(), Arc::new(RecordingMailer(tx)));

        let chat = ChatService::new(Arc::new(SqliteChatStore::new(db.clone())), storage, tokens, bus.clone());
        let state = Arc::new(AppStateInner {
            db,
            chat,
            kv,
            bus,
            hub: hub.clone(),
            jwt_secret: "test-secret".into(),
            public_url: "http://parley.test/".into(),
        });

        Ok(Self {
            app: router(state),
            hub,
            mail,
            _tmp: tmp,
        })
    }

    async fn call(&self, req: Request<Body>) -> anyhow::Result<(StatusCode, Vec<u8>)> {
        let res = self.app.clone().oneshot(req).await?;
        let status = res.status();
        let body = res.into_body().collect().await?.to_bytes();
        Ok((status, body.to_vec()))
    }

    async fn json(&self, req: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
        let (status, body) = self.call(req).await?;
        let value = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body)? };
        Ok((status, value))
    }

    /// Register, follow the mailed link, log in. Returns (user id, jwt).
    async fn signup(&mut self, username: &str) -> anyhow::Result<(Uuid, String)> {
        let (status, _) = self
            .json(post_json(
                "/auth/register",
                json!({
                    "username": username,
                    "full_name": format!("{} Test", username),
                    "email": format!("{}@parley.test", username),
                    "password": "correct horse",
                }),
            ))
            .await?;
        assert_eq!(status, StatusCode::CREATED);

        let mail = tokio::time::timeout(Duration::from_secs(5), self.mail.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("mailer closed"))?;
        let link = activation_path(&mail.html_body);

        let (status, body) = self.json(get(&link, None)).await?;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (status, body) = self
            .json(post_json(
                "/auth/login",
                json!({ "username": username, "password": "correct horse" }),
            ))
            .await?;
        assert_eq!(status, StatusCode::OK);
        let id = body["user_id"].as_str().unwrap_or_default().parse()?;
        let token = body["token"].as_str().unwrap_or_default().to_string();
        Ok((id, token))
    }
}

fn activation_path(html: &str) -> String {
    let start = html.find("/auth/verify/").expect("activation link in mail");
    let rest = &html[start..];
    let end = rest.find('"').unwrap_or(rest.len());
    rest[..end].to_string()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut req = Request::get(uri);
    if let Some(t) = token {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    req.body(Body::empty()).unwrap()
}

fn with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

fn chat_form(token: &str, receiver: Uuid, text: &str, files: &[&[u8]]) -> Request<Body> {
    let receiver = receiver.to_string();
    chat_form_fields(token, &[("receiver_id", receiver.as_str()), ("chat_text", text)], files)
}

fn chat_form_fields(token: &str, fields: &[(&str, &str)], files: &[&[u8]]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    for (i, data) in files.iter().enumerate() {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"chat_media\"; filename=\"f{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, i
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::post("/chat/post-message")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// A live connection for `user`: joins their room and returns its queue.
async fn connect(app: &TestApp, user: Uuid) -> anyhow::Result<mpsc::Receiver<Payload>> {
    let (tx, rx) = mpsc::channel::<Payload>(16);
    app.hub
        .join(
            &user_room_key(user),
            Member {
                id: Uuid::new_v4(),
                user_id: user,
                tx,
            },
        )
        .await?;
    Ok(rx)
}

async fn next_frame(socket: &mut mpsc::Receiver<Payload>) -> anyhow::Result<Value> {
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("socket queue closed"))?;
    Ok(serde_json::from_str(&frame)?)
}

#[tokio::test]
async fn health_and_auth_guards() -> TestResult {
    let app = TestApp::new().await?;

    let (status, body) = app.json(get("/health", None)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = app.call(get("/chat/latest", None)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call(get("/chat/latest", Some("not-a-jwt"))).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.call(get("/auth/verify/unknown-token", None)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn login_requires_verification_and_names_are_unique() -> TestResult {
    let app = TestApp::new().await?;
    let register = json!({
        "username": "carol",
        "full_name": "Carol",
        "email": "carol@parley.test",
        "password": "long enough",
    });

    let (status, _) = app.json(post_json("/auth/register", register.clone())).await?;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = app.json(post_json("/auth/register", register)).await?;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = app
        .json(post_json("/auth/login", json!({ "username": "carol", "password": "long enough" })))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn message_with_attachment_reaches_receiver_room() -> TestResult {
    let mut app = TestApp::new().await?;
    let (alice, alice_jwt) = app.signup("alice").await?;
    let (bob, bob_jwt) = app.signup("bob").await?;

    // Bob has a live connection in his room.
    let mut bob_socket = connect(&app, bob).await?;

    let (status, body) = app.json(chat_form(&alice_jwt, bob, "hi bob", &[PNG])).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let chat_id = body["data"]["chat_id"].as_str().unwrap_or_default().to_string();
    assert_eq!(body["data"]["attachment_access"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"]["is_own_message"], true);

    let frame = next_frame(&mut bob_socket).await?;
    assert_eq!(frame["action"], "PRIVATE_MESSAGE");
    assert_eq!(frame["detail"], "NEW MESSAGE ARRIVED");
    assert_eq!(frame["type"], "OK");
    assert_eq!(frame["data"]["chat_id"], chat_id.as_str());
    assert_eq!(frame["data"]["from"]["id"], alice.to_string().as_str());
    assert_eq!(frame["data"]["from"]["username"], "alice");

    // History from Bob's side mints a fresh token that serves the file.
    let (status, body) = app
        .json(get(&format!("/chat/between/{}", alice), Some(&bob_jwt)))
        .await?;
    assert_eq!(status, StatusCode::OK);
    let chats = body["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0]["is_own_message"], false);
    let token = chats[0]["attachment_access"][0].as_str().unwrap_or_default().to_string();

    let (status, bytes) = app
        .call(get(&format!("/chat/attachment/{}", token), Some(&bob_jwt)))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, PNG);

    let (status, body) = app.json(get("/chat/latest", Some(&bob_jwt))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["partner_username"], "alice");
    assert_eq!(body["data"][0]["unread_count"], 1);

    let (status, body) = app
        .json(authed("PATCH", &format!("/chat/read/{}", alice), &bob_jwt))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["updated"], 1);

    // Only the sender may delete.
    let (status, _) = app
        .json(authed("DELETE", &format!("/chat/delete/{}", chat_id), &bob_jwt))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app
        .json(authed("DELETE", &format!("/chat/delete/{}", chat_id), &alice_jwt))
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .json(get(&format!("/chat/between/{}", alice), Some(&bob_jwt)))
        .await?;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn rejected_posts_report_status_and_message() -> TestResult {
    let mut app = TestApp::new().await?;
    let (_alice, alice_jwt) = app.signup("alice").await?;
    let (bob, _) = app.signup("bob").await?;

    let (status, body) = app
        .json(chat_form(&alice_jwt, bob, "bin", &[b"\x7fELF\x02\x01\x01\0"]))
        .await?;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["code"], 415);

    let (status, body) = app.json(chat_form(&alice_jwt, bob, "", &[])).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let big = vec![b'a'; 5 * 1024 * 1024 + 1];
    let (status, _) = app.json(chat_form(&alice_jwt, bob, "big", &[&big])).await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
async fn text_message_reaches_each_room_exactly_once() -> TestResult {
    let mut app = TestApp::new().await?;
    let (alice, alice_jwt) = app.signup("alice").await?;
    let (bob, _) = app.signup("bob").await?;
    let mut alice_socket = connect(&app, alice).await?;
    let mut bob_socket = connect(&app, bob).await?;

    let (status, body) = app.json(chat_form(&alice_jwt, bob, "just text", &[])).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let chat_id = body["data"]["chat_id"].as_str().unwrap_or_default().to_string();
    assert_eq!(body["data"]["attachment_access"].as_array().map(Vec::len), Some(0));

    let to_bob = next_frame(&mut bob_socket).await?;
    assert_eq!(to_bob["detail"], "NEW MESSAGE ARRIVED");
    assert_eq!(to_bob["data"]["chat_id"], chat_id.as_str());
    assert_eq!(to_bob["data"]["message"], "just text");

    let to_alice = next_frame(&mut alice_socket).await?;
    assert_eq!(to_alice["detail"], "MESSAGE SUCCESSFULLY DELIVERED");
    assert_eq!(to_alice["data"]["chat_id"], chat_id.as_str());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bob_socket.try_recv().is_err());
    assert!(alice_socket.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn unknown_receiver_or_reply_target_is_not_found() -> TestResult {
    let mut app = TestApp::new().await?;
    let (_alice, alice_jwt) = app.signup("alice").await?;
    let (bob, _) = app.signup("bob").await?;

    let (status, body) = app.json(chat_form(&alice_jwt, Uuid::new_v4(), "anyone there?", &[])).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
    assert_eq!(body["message"], "receiver not found");

    let bob_id = bob.to_string();
    let dangling = Uuid::new_v4().to_string();
    let (status, body) = app
        .json(chat_form_fields(
            &alice_jwt,
            &[("receiver_id", bob_id.as_str()), ("reply_to", dangling.as_str()), ("chat_text", "re: nothing")],
            &[],
        ))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "reply_to chat not found");

    let (_, body) = app
        .json(get(&format!("/chat/between/{}", bob), Some(&alice_jwt)))
        .await?;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(0));
    Ok(())
}

#[tokio::test]
async fn body_over_the_request_limit_is_too_large() -> TestResult {
    let mut app = TestApp::new().await?;
    let (_alice, alice_jwt) = app.signup("alice").await?;
    let (bob, _) = app.signup("bob").await?;

    let bob_id = bob.to_string();
    let huge = "a".repeat(MAX_BODY_SIZE);
    let (status, body) = app
        .json(chat_form_fields(&alice_jwt, &[("receiver_id", bob_id.as_str()), ("chat_text", huge.as_str())], &[]))
        .await?;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], 413);
    Ok(())
}

#[tokio::test]
async fn refresh_cookie_renews_access_to_own_profile() -> TestResult {
    let mut app = TestApp::new().await?;
    let (alice, _) = app.signup("alice").await?;

    let res = app
        .app
        .clone()
        .oneshot(post_json(
            "/auth/login",
            json!({ "username": "alice", "password": "correct horse" }),
        ))
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let cookie = res
        .headers()
        .get(header::SET_COOKIE)
        .ok_or("login set no cookie")?
        .to_str()?
        .to_string();
    assert!(cookie.contains("HttpOnly"));
    let session = cookie.split(';').next().unwrap_or_default().to_string();
    assert!(session.starts_with("refreshToken="));

    let (status, _) = app.call(get("/auth/refresh-session", None)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app.call(with_cookie("/auth/refresh-session", "refreshToken=forged")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.json(with_cookie("/auth/refresh-session", &session)).await?;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["user_id"], alice.to_string().as_str());
    let token = body["token"].as_str().unwrap_or_default().to_string();

    let (status, body) = app.json(get("/user/me", Some(&token))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], alice.to_string().as_str());
    assert_eq!(body["data"]["username"], "alice");
    assert_eq!(body["data"]["email"], "alice@parley.test");
    assert_eq!(body["data"]["verified"], true);
    assert!(body["data"].get("password").is_none());

    let (status, _) = app.call(get("/user/me", None)).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}
