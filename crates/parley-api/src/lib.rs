pub mod auth;
pub mod chat;
pub mod error;
pub mod kv;
pub mod media;
pub mod middleware;
pub mod probe;
pub mod routes;
pub mod service;
pub mod state;
pub mod storage;
pub mod store;
pub mod users;

pub use error::ChatError;
pub use routes::router;
pub use service::ChatService;
pub use state::{AppState, AppStateInner};
