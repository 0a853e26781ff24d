use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_types::events::{
    Action, JoinRoomEventData, PrivateMessageData, PrivateMessageRequest, WebsocketEvent,
    user_room_key,
};
use parley_types::models::UserMetadata;

use crate::error::GatewayError;
use crate::hub::Hub;
use crate::room::{CLIENT_BUFFER, Member, Payload, Room};

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between pongs before the connection is considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Pings go out at 90% of the pong window.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Largest inbound frame accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Read side of one connection: who it is, where it lives, and a weak handle
/// to its own outbound queue for error replies.
///
/// `room` is the room joined at connect time and is only used to leave it.
/// Broadcasts go through the hub, since a registration can be re-homed to a
/// newer room for the same key.
struct Client {
    id: Uuid,
    user_id: Uuid,
    key: String,
    hub: Hub,
    room: Room,
    reply: mpsc::WeakSender<Payload>,
}

/// Drive one authenticated connection until either side gives up.
///
/// Joins the user's room, runs the write pump as its own task and the read
/// pump inline, then unregisters. The transport is passed as separate sink
/// and stream halves (see `StreamExt::split`).
pub async fn serve<Si, St, E>(sink: Si, stream: St, hub: Hub, user_id: Uuid)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let id = Uuid::new_v4();
    let key = user_room_key(user_id);
    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    let reply = tx.downgrade();

    let room = match hub.join(&key, Member { id, user_id, tx }).await {
        Ok(room) => room,
        Err(e) => {
            warn!("User {} could not join {}: {}", user_id, key, e);
            return;
        }
    };
    info!("User {} connected to gateway (conn {})", user_id, id);

    let client = Client {
        id,
        user_id,
        key,
        hub,
        room,
        reply,
    };

    let mut write_task = tokio::spawn(write_pump(sink, rx));

    tokio::select! {
        _ = &mut write_task => {}
        _ = read_pump(stream, &client) => {}
    }

    client.leave().await;

    // Leaving drops the room's sender; the writer sends its close notice and
    // exits on its own.
    if !write_task.is_finished() {
        let _ = tokio::time::timeout(WRITE_WAIT * 2, write_task).await;
    }
    info!("User {} disconnected from gateway (conn {})", user_id, id);
}

async fn read_pump<St, E>(mut stream: St, client: &Client)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + PONG_WAIT;

    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                warn!("User {} missed pong deadline, dropping connection", client.user_id);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("User {} read error: {}", client.user_id, e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!("User {} sent oversized frame ({} bytes)", client.user_id, text.len());
                    break;
                }
                client.handle_text(text.as_str()).await;
            }
            Message::Binary(_) => client.reply_error("binary frames are not supported"),
            Message::Pong(_) => deadline = Instant::now() + PONG_WAIT,
            Message::Close(_) => break,
            Message::Ping(_) => {}
        }
    }
}

async fn write_pump<Si>(mut sink: Si, mut rx: mpsc::Receiver<Payload>)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(payload) = next else {
                    send_close(&mut sink).await;
                    return;
                };
                if let Err(e) = write_frame(&mut sink, Message::Text(payload.to_string().into())).await {
                    debug!("Write failed: {}", e);
                    return;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new())).await {
                    debug!("Ping failed: {}", e);
                    return;
                }
            }
        }
    }
}

async fn write_frame<Si>(sink: &mut Si, msg: Message) -> Result<(), GatewayError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(GatewayError::Transport(e.to_string())),
        Err(_) => Err(GatewayError::Transport("write deadline exceeded".into())),
    }
}

/// Best effort: tell the peer why the stream is ending, then close.
async fn send_close<Si>(sink: &mut Si)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let notice = WebsocketEvent::ok(Action::System, "connection closed", serde_json::Value::Null);
    if let Ok(json) = notice.to_json() {
        if write_frame(sink, Message::Text(json.into())).await.is_err() {
            return;
        }
    }
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("connection closed"),
    }));
    let _ = write_frame(sink, close).await;
}

impl Client {
    async fn handle_text(&self, text: &str) {
        let event: WebsocketEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                debug!("User {} bad frame: {} -- raw: {}", self.user_id, e, preview);
                self.reply_error("invalid frame");
                return;
            }
        };

        match event.action {
            Action::Subscribe => self.handle_subscribe(event, text).await,
            Action::PrivateMessage => self.handle_private_message(event).await,
            _ => self.reply_error("event not supported"),
        }
    }

    /// Subscribe traffic is echoed verbatim to everyone in the client's room.
    async fn handle_subscribe(&self, event: WebsocketEvent, raw: &str) {
        let valid = serde_json::from_value::<JoinRoomEventData>(event.data)
            .map(|d| d.is_valid())
            .unwrap_or(false);
        if !valid {
            self.reply_error("join_to is required");
            return;
        }

        self.hub.send_payload_to(&self.key, Arc::from(raw)).await;
    }

    /// Rebuild the message with the authenticated sender and push it to the
    /// sender's room and the receiver's room.
    async fn handle_private_message(&self, event: WebsocketEvent) {
        let request = match serde_json::from_value::<PrivateMessageRequest>(event.data) {
            Ok(request) if request.is_valid() => request,
            Ok(_) => {
                self.reply_error("message or media_url is required");
                return;
            }
            Err(_) => {
                self.reply_error("invalid private message");
                return;
            }
        };

        let data = PrivateMessageData {
            chat_id: None,
            to: request.to,
            message: request.message,
            media_url: request.media_url,
            from: UserMetadata::id_only(self.user_id),
        };
        let value = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode private message: {}", e);
                return;
            }
        };
        let frame = WebsocketEvent::ok(Action::PrivateMessage, event.detail, value);
        let payload: Payload = match frame.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!("Failed to encode private message: {}", e);
                return;
            }
        };

        self.hub.send_payload_to(&self.key, payload.clone()).await;
        let receiver_key = user_room_key(request.to);
        if receiver_key != self.key {
            self.hub.send_payload_to(&receiver_key, payload).await;
        }
    }

    /// Error frames go only to this client. Dropped if the queue is gone or full.
    fn reply_error(&self, detail: &str) {
        let Some(tx) = self.reply.upgrade() else {
            return;
        };
        match WebsocketEvent::error(detail).to_json() {
            Ok(json) => {
                let _ = tx.try_send(Arc::from(json));
            }
            Err(e) => warn!("Failed to encode error frame: {}", e),
        }
    }

    async fn leave(&self) {
        self.room.unregister(self.id).await;
        // A pending registration may have been moved to a newer room.
        if let Some(current) = self.hub.get(&self.key) {
            if current.id() != self.room.id() {
                current.unregister(self.id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Inbound half backed by a tokio channel.
    struct TestStream(mpsc::UnboundedReceiver<Result<Message, std::io::Error>>);

    impl Stream for TestStream {
        type Item = Result<Message, std::io::Error>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.0.poll_recv(cx)
        }
    }

    /// Outbound half that records every frame written.
    struct TestSink(mpsc::UnboundedSender<Message>);

    impl Sink<Message> for TestSink {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0
                .send(item)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Peer {
        inbound: mpsc::UnboundedSender<Result<Message, std::io::Error>>,
        outbound: mpsc::UnboundedReceiver<Message>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Peer {
        fn send_text(&self, text: &str) {
            self.inbound.send(Ok(Message::Text(text.to_string().into()))).unwrap();
        }

        async fn next_json(&mut self) -> serde_json::Value {
            loop {
                match self.outbound.recv().await.expect("connection closed") {
                    Message::Text(t) => return serde_json::from_str(t.as_str()).unwrap(),
                    Message::Ping(_) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        }
    }

    fn connect(hub: &Hub, user_id: Uuid) -> Peer {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(TestSink(out_tx), TestStream(in_rx), hub.clone(), user_id));
        Peer {
            inbound: in_tx,
            outbound: out_rx,
            task,
        }
    }

    async fn wait_joined(hub: &Hub, user_id: Uuid) {
        while hub.get(&user_room_key(user_id)).is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let hub = Hub::new();
        let mut peer = connect(&hub, Uuid::new_v4());

        peer.send_text("not json");
        let reply = peer.next_json().await;
        assert_eq!(reply["action"], "SYSTEM");
        assert_eq!(reply["type"], "ERROR");

        peer.send_text(r#"{"action":"DANCE","detail":"","data":{}}"#);
        let reply = peer.next_json().await;
        assert_eq!(reply["type"], "ERROR");
        assert_eq!(reply["detail"], "event not supported");
    }

    #[tokio::test]
    async fn subscribe_is_validated_then_echoed_raw() {
        let hub = Hub::new();
        let mut peer = connect(&hub, Uuid::new_v4());

        peer.send_text(r#"{"action":"SUBSCRIBE","detail":"","data":{"join_to":""}}"#);
        let reply = peer.next_json().await;
        assert_eq!(reply["type"], "ERROR");

        let raw = r#"{"action":"SUBSCRIBE","detail":"hi","data":{"join_to":"lobby"}}"#;
        peer.send_text(raw);
        let echo = peer.next_json().await;
        assert_eq!(echo, serde_json::from_str::<serde_json::Value>(raw).unwrap());
    }

    #[tokio::test]
    async fn private_message_reaches_both_rooms_with_sender_id() {
        let hub = Hub::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut a = connect(&hub, alice);
        let mut b = connect(&hub, bob);
        wait_joined(&hub, alice).await;
        wait_joined(&hub, bob).await;

        let frame = serde_json::json!({
            "action": "PRIVATE_MESSAGE",
            "detail": "dm",
            "data": {"to": bob, "message": "hey"}
        });
        a.send_text(&frame.to_string());

        for got in [a.next_json().await, b.next_json().await] {
            assert_eq!(got["action"], "PRIVATE_MESSAGE");
            assert_eq!(got["type"], "OK");
            assert_eq!(got["data"]["from"]["id"], alice.to_string());
            assert_eq!(got["data"]["to"], bob.to_string());
            assert_eq!(got["data"]["message"], "hey");
        }
    }

    #[tokio::test]
    async fn private_message_without_content_is_rejected() {
        let hub = Hub::new();
        let mut peer = connect(&hub, Uuid::new_v4());

        let frame = serde_json::json!({
            "action": "PRIVATE_MESSAGE",
            "detail": "",
            "data": {"to": Uuid::new_v4(), "message": ""}
        });
        peer.send_text(&frame.to_string());
        assert_eq!(peer.next_json().await["type"], "ERROR");

        peer.send_text(r#"{"action":"PRIVATE_MESSAGE","detail":"","data":{"to":"nope","message":"x"}}"#);
        assert_eq!(peer.next_json().await["type"], "ERROR");
    }

    #[tokio::test]
    async fn peer_close_sends_notice_and_removes_room() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let mut peer = connect(&hub, user);
        wait_joined(&hub, user).await;

        drop(peer.inbound);
        peer.task.await.unwrap();

        let notice = match peer.outbound.recv().await.unwrap() {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(t.as_str()).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        };
        assert_eq!(notice["action"], "SYSTEM");
        assert!(matches!(peer.outbound.recv().await, Some(Message::Close(_))));

        while hub.get(&user_room_key(user)).is_some() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_pong_deadline() {
        let hub = Hub::new();
        let mut peer = connect(&hub, Uuid::new_v4());

        let mut frames = Vec::new();
        while let Some(frame) = peer.outbound.recv().await {
            frames.push(frame);
        }

        // One ping at 54s, then the deadline at 60s closes the connection.
        assert!(matches!(frames.first(), Some(Message::Ping(_))));
        assert!(matches!(frames.last(), Some(Message::Close(_))));
        peer.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pong_extends_deadline() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let mut peer = connect(&hub, user);
        wait_joined(&hub, user).await;

        tokio::time::sleep(Duration::from_secs(50)).await;
        peer.inbound.send(Ok(Message::Pong(Bytes::new()))).unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;

        // 100s in, still connected thanks to the pong at 50s.
        assert!(!peer.task.is_finished());
        peer.send_text("bad");
        assert_eq!(peer.next_json().await["type"], "ERROR");
    }

    #[tokio::test]
    async fn echoes_follow_a_rehomed_registration() {
        let hub = Hub::new();
        let user_id = Uuid::new_v4();
        let key = user_room_key(user_id);

        // The room joined at connect time empties out and terminates.
        let (placeholder, _placeholder_rx) = mpsc::channel(1);
        let placeholder_id = Uuid::new_v4();
        let stale = hub
            .join(&key, Member { id: placeholder_id, user_id, tx: placeholder })
            .await
            .unwrap();
        stale.unregister(placeholder_id).await;
        while hub.get(&key).is_some() {
            tokio::task::yield_now().await;
        }

        // The connection now lives in a newer room for the same key.
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        let reply = tx.downgrade();
        let current = hub.join(&key, Member { id, user_id, tx }).await.unwrap();
        assert_ne!(current.id(), stale.id());

        let client = Client {
            id,
            user_id,
            key: key.clone(),
            hub: hub.clone(),
            room: stale,
            reply,
        };

        let raw = r#"{"action":"SUBSCRIBE","detail":"","data":{"join_to":"lobby"}}"#;
        client.handle_text(raw).await;
        let echo = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("subscribe echo")
            .unwrap();
        assert_eq!(&*echo, raw);

        let frame = serde_json::json!({
            "action": "PRIVATE_MESSAGE",
            "detail": "dm",
            "data": {"to": Uuid::new_v4(), "message": "hey"}
        });
        client.handle_text(&frame.to_string()).await;
        let echo = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("private message echo")
            .unwrap();
        let echo: serde_json::Value = serde_json::from_str(&echo).unwrap();
        assert_eq!(echo["data"]["message"], "hey");

        client.leave().await;
        while hub.get(&key).is_some() {
            tokio::task::yield_now().await;
        }
    }
}
