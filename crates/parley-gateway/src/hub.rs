use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::error::GatewayError;
use crate::room::{Member, Payload, Room};

/// Attempts `join` makes before giving up on a key whose rooms keep closing.
const JOIN_ATTEMPTS: usize = 3;

/// Process-wide directory of live rooms, keyed by room key.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    rooms: Mutex<HashMap<String, Room>>,
}

/// Non-owning handle held by room loops, so a running room never keeps the
/// hub alive.
#[derive(Clone)]
pub(crate) struct WeakHub(Weak<HubInner>);

impl WeakHub {
    pub(crate) fn upgrade(&self) -> Option<Hub> {
        self.0.upgrade().map(|inner| Hub { inner })
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        // The map stays consistent even if a holder panicked.
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Existing room for `key`, or a freshly started one. The whole
    /// check-then-create runs under the directory lock, so concurrent callers
    /// always see the same room.
    pub fn get_or_create(&self, key: &str) -> Room {
        let mut rooms = self.rooms();
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }

        let room = Room::spawn(key, WeakHub(Arc::downgrade(&self.inner)));
        rooms.insert(key.to_string(), room.clone());
        info!("Room created for {}", key);
        room
    }

    pub fn get(&self, key: &str) -> Option<Room> {
        self.rooms().get(key).cloned()
    }

    /// Drop the directory entry for `key` if it still points at room
    /// `room_id`. Called by a room on its way out; a late call never removes
    /// a newer room for the same key. Returns whether an entry was removed.
    pub fn remove(&self, key: &str, room_id: uuid::Uuid) -> bool {
        let mut rooms = self.rooms();
        match rooms.get(key) {
            Some(room) if room.id() == room_id => {
                rooms.remove(key);
                debug!("Room for {} removed from hub", key);
                true
            }
            _ => false,
        }
    }

    /// Register `member` in the room for `key`, creating the room on demand.
    /// If the room terminates between lookup and registration, the member is
    /// handed to the room that replaces it.
    pub async fn join(&self, key: &str, member: Member) -> Result<Room, GatewayError> {
        let mut member = member;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.get_or_create(key);
            match room.register(member).await {
                Ok(()) => return Ok(room),
                Err(returned) => {
                    debug!("Room {} closed during join, retrying", room.id());
                    member = returned;
                }
            }
        }
        Err(GatewayError::RoomClosed(key.to_string()))
    }

    /// Broadcast to the room for `key` if one is live. Users without an open
    /// connection simply miss the push.
    pub async fn send_payload_to(&self, key: &str, payload: Payload) {
        let Some(room) = self.get(key) else {
            debug!("No live room for {}, push skipped", key);
            return;
        };
        if let Err(e) = room.broadcast(payload).await {
            debug!("Push to {} dropped: {}", key, e);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }
}
