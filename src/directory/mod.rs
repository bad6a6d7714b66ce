//! Device directory: device classifications and authorized users
//!
//! The directory is a remote key/value service shared by the ingestor
//! (classification upsert) and the evaluator (authorization reads). Every
//! call round-trips to the backing store; there is no local cache layer.

use crate::error::Result;
use crate::types::DeviceClassification;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

pub mod connection;
pub mod redis;

pub use connection::{BackoffPolicy, ConnectionSlot, ConnectionState};
pub use self::redis::RedisDirectory;

/// Classification and authorization lookups
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Classification for a device, if one was recorded
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceClassification>>;

    /// Record a classification; repeating the same write is a no-op
    async fn upsert(&self, device_id: &str, classification: &DeviceClassification) -> Result<()>;

    /// Whether the user is in the authorized set
    async fn is_authorized(&self, user_id: &str) -> Result<bool>;

    /// Add a user to the authorized set
    async fn authorize(&self, user_id: &str) -> Result<()>;
}

/// In-memory directory for development and testing
#[derive(Default)]
pub struct MemoryDirectory {
    sensors: RwLock<HashMap<String, DeviceClassification>>,
    authorized_users: RwLock<HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of classified devices
    pub async fn device_count(&self) -> usize {
        self.sensors.read().await.len()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceClassification>> {
        Ok(self.sensors.read().await.get(device_id).cloned())
    }

    async fn upsert(&self, device_id: &str, classification: &DeviceClassification) -> Result<()> {
        self.sensors
            .write()
            .await
            .insert(device_id.to_string(), classification.clone());
        Ok(())
    }

    async fn is_authorized(&self, user_id: &str) -> Result<bool> {
        Ok(self.authorized_users.read().await.contains(user_id))
    }

    async fn authorize(&self, user_id: &str) -> Result<()> {
        self.authorized_users
            .write()
            .await
            .insert(user_id.to_string());
        Ok(())
    }
}
