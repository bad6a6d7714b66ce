//! Redis-backed device directory
//!
//! Classifications live in the `registered_sensors` hash (device id →
//! JSON `{"device_type": ...}`); authorized users in the
//! `authorized_users` set.

use super::connection::{BackoffPolicy, ConnectionSlot, ConnectionState};
use super::DeviceDirectory;
use crate::error::{PipelineError, Result};
use crate::types::DeviceClassification;
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisError, RedisResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Hash holding device classifications
pub const SENSOR_KEY: &str = "registered_sensors";

/// Set holding authorized user identifiers
pub const AUTHORIZED_USERS_KEY: &str = "authorized_users";

/// Upper bound on establishing and verifying a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Device directory on a Redis server
pub struct RedisDirectory {
    client: ::redis::Client,
    slot: ConnectionSlot<MultiplexedConnection>,
    connect_timeout: Duration,
}

impl RedisDirectory {
    /// Create a directory handle without connecting
    ///
    /// The first operation establishes the connection.
    pub fn new(url: &str, policy: BackoffPolicy) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| PipelineError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            slot: ConnectionSlot::new(policy),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Bound connection attempts; other callers wait on the slot meanwhile
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Create a directory handle and verify the server is reachable
    pub async fn connect(url: &str, policy: BackoffPolicy) -> Result<Self> {
        let directory = Self::new(url, policy)?;
        directory.connection().await?;
        tracing::info!("Connected to Redis directory");
        Ok(directory)
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.slot.state().await
    }

    /// Close the connection; the next operation reconnects
    pub async fn disconnect(&self) {
        self.slot.disconnect().await;
        tracing::info!("Redis directory disconnected");
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.slot
            .get(|| async {
                match tokio::time::timeout(self.connect_timeout, self.open()).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::directory(format!(
                        "connect timed out after {}ms",
                        self.connect_timeout.as_millis()
                    ))),
                }
            })
            .await
    }

    async fn open(&self) -> Result<MultiplexedConnection> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PipelineError::directory(e.to_string()))?;

        let pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::directory(format!("ping failed: {}", e)))?;
        if pong != "PONG" {
            return Err(PipelineError::directory(format!(
                "unexpected ping reply: {}",
                pong
            )));
        }

        Ok(conn)
    }

    /// Run one command, invalidating the connection on link failures
    async fn run<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match f(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_link_error(&e) {
                    self.slot.invalidate().await;
                }
                Err(PipelineError::directory(format!("{} failed: {}", op, e)))
            }
        }
    }
}

fn is_link_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

#[async_trait]
impl DeviceDirectory for RedisDirectory {
    async fn lookup(&self, device_id: &str) -> Result<Option<DeviceClassification>> {
        let data: Option<String> = self
            .run("HGET", |mut conn| async move {
                conn.hget(SENSOR_KEY, device_id).await
            })
            .await?;

        let classification = match data {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        tracing::debug!(
            device_id,
            found = classification.is_some(),
            "Directory lookup"
        );
        Ok(classification)
    }

    async fn upsert(&self, device_id: &str, classification: &DeviceClassification) -> Result<()> {
        let json = serde_json::to_string(classification)?;
        self.run("HSET", |mut conn| async move {
            conn.hset::<_, _, _, ()>(SENSOR_KEY, device_id, json).await
        })
        .await?;

        tracing::debug!(device_id, device_type = %classification.device_type, "Device classified");
        Ok(())
    }

    async fn is_authorized(&self, user_id: &str) -> Result<bool> {
        let authorized: bool = self
            .run("SISMEMBER", |mut conn| async move {
                conn.sismember(AUTHORIZED_USERS_KEY, user_id).await
            })
            .await?;

        tracing::debug!(user_id, authorized, "Authorization check");
        Ok(authorized)
    }

    async fn authorize(&self, user_id: &str) -> Result<()> {
        self.run("SADD", |mut conn| async move {
            conn.sadd::<_, _, ()>(AUTHORIZED_USERS_KEY, user_id).await
        })
        .await?;

        tracing::info!(user_id, "User authorized");
        Ok(())
    }
}
