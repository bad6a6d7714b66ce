//! NATS JetStream channel configuration

use serde::{Deserialize, Serialize};

/// Storage backend for the JetStream stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persisted to disk; survives broker restart
    #[default]
    File,
    /// Held in memory; lost on broker restart
    Memory,
}

/// Configuration for the NATS JetStream provider
///
/// The queue is modelled as a work-queue stream: each envelope is retained
/// until a consumer acknowledges or terminates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// JetStream stream name (the queue)
    pub stream_name: String,

    /// Subject envelopes are published to
    pub subject: String,

    /// Stream storage backend
    pub storage: StorageType,

    /// Maximum stored envelopes (-1 = unlimited)
    pub max_events: i64,

    /// Maximum envelope age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    /// Window in which repeated `Nats-Msg-Id` publishes are discarded
    pub duplicate_window_secs: u64,

    /// Optional auth token
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::for_queue("nats://127.0.0.1:4222", "iot_events")
    }
}

impl NatsConfig {
    /// Configuration for a named queue on the given server
    pub fn for_queue(url: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            url: url.into(),
            subject: format!("{}.envelopes", queue),
            stream_name: queue,
            storage: StorageType::File,
            max_events: -1,
            max_age_secs: 0,
            max_bytes: -1,
            duplicate_window_secs: 120,
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}
