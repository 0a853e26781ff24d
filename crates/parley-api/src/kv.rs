use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{info, warn};

/// One hash to write, expiring after `ttl`.
#[derive(Debug, Clone)]
pub struct HashEntry {
    pub key: String,
    pub fields: Vec<(String, String)>,
    pub ttl: Duration,
}

/// Hash-with-expiry store holding media grants and verification tokens.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Write every entry together.
    async fn set_hashes(&self, entries: Vec<HashEntry>) -> Result<()>;

    /// All fields of `key`, or `None` when it is missing or expired.
    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_hashes(&self, entries: Vec<HashEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in &entries {
            pipe.hset_multiple(&entry.key, entry.fields.as_slice()).ignore();
            pipe.cmd("PEXPIRE")
                .arg(&entry.key)
                .arg(entry.ttl.as_millis() as u64)
                .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Single-process store used when no Redis URL is configured, and by tests.
/// Expiry follows the tokio clock.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (HashMap<String, String>, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_hashes(&self, entries: Vec<HashEntry>) -> Result<()> {
        let now = Instant::now();
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // Entries nobody reads again are only reclaimed here.
        map.retain(|_, (_, expires)| *expires > now);
        for entry in entries {
            let fields = entry.fields.into_iter().collect();
            map.insert(entry.key, (fields, now + entry.ttl));
        }
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(key) {
            Some((fields, expires)) if *expires > Instant::now() => Ok(Some(fields.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Redis when a URL is given and reachable, otherwise the in-memory store.
pub async fn connect(redis_url: Option<&str>) -> Arc<dyn KeyValueStore> {
    if let Some(url) = redis_url {
        match RedisStore::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!("Failed to connect to redis, using in-memory store: {}", e),
        }
    } else {
        warn!("No redis URL configured, using in-memory store");
    }
    Arc::new(MemoryStore::new())
}
