use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::hub::WeakHub;

/// Serialized frame shared between every member it is fanned out to.
pub type Payload = Arc<str>;

/// Capacity of each client's outbound queue. A client that falls this far
/// behind is evicted on the next broadcast.
pub const CLIENT_BUFFER: usize = 256;

const ROOM_BUFFER: usize = 256;

/// A client as seen by its room: connection id, owner and the strong end of
/// its outbound queue. Dropping the member closes the queue.
#[derive(Debug)]
pub struct Member {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx: mpsc::Sender<Payload>,
}

/// Handle to one room's broadcast loop.
///
/// Cloning is cheap; every clone talks to the same loop. The loop owns the
/// member set, so register, unregister and broadcast are totally ordered.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    id: Uuid,
    key: String,
    register_tx: mpsc::Sender<Member>,
    unregister_tx: mpsc::Sender<Uuid>,
    broadcast_tx: mpsc::Sender<Payload>,
}

impl Room {
    /// Start a new room loop for `key`. The loop reports back to `hub` when
    /// it terminates.
    pub(crate) fn spawn(key: &str, hub: WeakHub) -> Self {
        let (register_tx, register_rx) = mpsc::channel(ROOM_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(ROOM_BUFFER);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(ROOM_BUFFER);

        let id = Uuid::new_v4();
        let room_loop = RoomLoop {
            id,
            key: key.to_string(),
            hub,
            members: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        tokio::spawn(room_loop.run());

        debug!("Room {} started for {}", id, key);
        Self {
            inner: Arc::new(RoomInner {
                id,
                key: key.to_string(),
                register_tx,
                unregister_tx,
                broadcast_tx,
            }),
        }
    }

    /// Identity of this room instance. A later room for the same key gets a
    /// different id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Hand a member to the loop. Gives the member back if the room has
    /// already terminated.
    pub async fn register(&self, member: Member) -> Result<(), Member> {
        self.inner
            .register_tx
            .send(member)
            .await
            .map_err(|e| e.0)
    }

    pub async fn unregister(&self, member_id: Uuid) {
        let _ = self.inner.unregister_tx.send(member_id).await;
    }

    pub async fn broadcast(&self, payload: Payload) -> Result<(), GatewayError> {
        self.inner
            .broadcast_tx
            .send(payload)
            .await
            .map_err(|_| GatewayError::RoomClosed(self.inner.key.clone()))
    }
}

struct RoomLoop {
    id: Uuid,
    key: String,
    hub: WeakHub,
    members: HashMap<Uuid, Member>,
    register_rx: mpsc::Receiver<Member>,
    unregister_rx: mpsc::Receiver<Uuid>,
    broadcast_rx: mpsc::Receiver<Payload>,
}

impl RoomLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                // Registration first so a member's own unregister never
                // overtakes it.
                biased;

                Some(member) = self.register_rx.recv() => {
                    debug!("Room {}: member {} (user {}) joined", self.key, member.id, member.user_id);
                    self.members.insert(member.id, member);
                }
                Some(member_id) = self.unregister_rx.recv() => {
                    if self.members.remove(&member_id).is_some() {
                        debug!("Room {}: member {} left", self.key, member_id);
                    }
                    if self.members.is_empty() {
                        break;
                    }
                }
                Some(payload) = self.broadcast_rx.recv() => {
                    self.fan_out(payload);
                }
                else => break,
            }
        }

        self.shutdown().await;
    }

    /// Non-blocking send to every member. Full or closed queues are evicted,
    /// which drops the room's sender and stops that client's writer.
    fn fan_out(&mut self, payload: Payload) {
        let key = &self.key;
        self.members.retain(|id, member| match member.tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Room {}: evicting slow client {} (user {})", key, id, member.user_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Room {}: dropping closed client {}", key, id);
                false
            }
        });
    }

    async fn shutdown(mut self) {
        let hub = self.hub.upgrade();
        if let Some(hub) = &hub {
            hub.remove(&self.key, self.id);
        }

        self.register_rx.close();
        self.unregister_rx.close();
        self.broadcast_rx.close();
        info!("Room {} ({}) terminated", self.key, self.id);

        // Registrations that were queued before the channel closed belong in
        // whichever room now serves this key.
        let mut pending = Vec::new();
        while let Ok(member) = self.register_rx.try_recv() {
            pending.push(member);
        }
        if let Some(hub) = hub {
            for member in pending {
                if let Err(e) = hub.join(&self.key, member).await {
                    warn!("Room {}: could not re-home pending member: {}", self.key, e);
                }
            }
        }
    }
}
