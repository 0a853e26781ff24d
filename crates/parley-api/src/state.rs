use std::sync::Arc;

use parley_db::Database;
use parley_events::EventBus;
use parley_gateway::Hub;

use crate::kv::KeyValueStore;
use crate::service::ChatService;

pub type AppState = Arc<AppStateInner>;

/// Everything a request handler can reach. Built once at startup.
pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    pub kv: Arc<dyn KeyValueStore>,
    pub bus: EventBus,
    pub hub: Hub,
    pub jwt_secret: String,
    /// Base URL put in activation links.
    pub public_url: String,
}
