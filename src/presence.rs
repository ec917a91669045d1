//! Which call a user is currently in.
//!
//! The Redis store is shared by every relay instance. The memory store keeps the
//! same contract inside one process and is used when no Redis URL is configured.

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use derivative::Derivative;
use redis::{aio::ConnectionManager, AsyncCommands};

use crate::{config::PresenceConfig, error::Error};

#[async_trait]
pub trait PresenceStore: Send + Sync + Debug {
    /// Records that `user_id` is in `room_id`. Entries expire after the configured TTL.
    async fn set_user_in_call(&self, user_id: &str, room_id: &str) -> Result<(), Error>;
    async fn remove_user_from_call(&self, user_id: &str) -> Result<(), Error>;
    /// Returns the room `user_id` is recorded in, if any.
    async fn is_user_busy(&self, user_id: &str) -> Result<Option<String>, Error>;
}

/// Connects the store selected by `config`.
pub async fn connect(config: &PresenceConfig) -> Result<Arc<dyn PresenceStore>, Error> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let store = RedisPresenceStore::connect(url, config).await?;
            tracing::info!("presence store: redis");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!(
                "presence store: memory. Busy checks only cover this process, configure REDIS_URL for multiple instances"
            );
            Ok(Arc::new(MemoryPresenceStore::new(config)))
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct RedisPresenceStore {
    #[derivative(Debug = "ignore")]
    connection: ConnectionManager,
    ttl: Duration,
    key_prefix: String,
}

impl RedisPresenceStore {
    pub async fn connect(url: &str, config: &PresenceConfig) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            ttl: config.ttl,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, user_id: &str) -> String {
        format!("{}{}", self.key_prefix, user_id)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_user_in_call(&self, user_id: &str, room_id: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: () = connection
            .set_ex(self.key(user_id), room_id, self.ttl.as_secs())
            .await?;
        tracing::debug!("user {} is in call {}", user_id, room_id);
        Ok(())
    }

    async fn remove_user_from_call(&self, user_id: &str) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(self.key(user_id)).await?;
        tracing::debug!("user {} left the call", user_id);
        Ok(())
    }

    async fn is_user_busy(&self, user_id: &str) -> Result<Option<String>, Error> {
        let mut connection = self.connection.clone();
        let room_id: Option<String> = connection.get(self.key(user_id)).await?;
        Ok(room_id)
    }
}

#[derive(Debug)]
struct PresenceEntry {
    room_id: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct MemoryPresenceStore {
    entries: DashMap<String, PresenceEntry>,
    ttl: Duration,
}

impl MemoryPresenceStore {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.ttl,
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_user_in_call(&self, user_id: &str, room_id: &str) -> Result<(), Error> {
        self.entries.insert(
            user_id.to_string(),
            PresenceEntry {
                room_id: room_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn remove_user_from_call(&self, user_id: &str) -> Result<(), Error> {
        self.entries.remove(user_id);
        Ok(())
    }

    async fn is_user_busy(&self, user_id: &str) -> Result<Option<String>, Error> {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        Ok(self.entries.get(user_id).map(|entry| entry.room_id.clone()))
    }
}
