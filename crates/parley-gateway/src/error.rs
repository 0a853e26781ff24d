use thiserror::Error;

/// Connection-level failures. Always local to one client or one room.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("room {0} is closed")]
    RoomClosed(String),
}
