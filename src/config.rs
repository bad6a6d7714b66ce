//! Process configuration read from the environment
//!
//! Variable names are the upper-cased field names (`DATABASE_URL`,
//! `QUEUE_NAME`, ...). A `.env` file in the working directory is loaded
//! first when present.

use crate::directory::BackoffPolicy;
use crate::error::{PipelineError, Result};
use crate::evaluator::EvaluatorConfig;
use crate::provider::nats::NatsConfig;
use crate::types::SubscribeOptions;
use serde::Deserialize;
use std::time::Duration;

/// Pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Relational store address
    pub database_url: String,

    /// Directory store address
    pub redis_url: String,

    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Queue (JetStream stream) name
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Durable consumer name shared by evaluator workers
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Deliveries before an envelope is dead-lettered
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u64,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Seconds between outbox relay passes
    #[serde(default = "default_outbox_interval_secs")]
    pub outbox_interval_secs: u64,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Debug-level logging
    #[serde(default)]
    pub debug: bool,

    /// JSON log lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_queue_name() -> String {
    "iot_events".to_string()
}

fn default_consumer_name() -> String {
    "rule-evaluator".to_string()
}

fn default_max_deliver() -> u64 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_outbox_interval_secs() -> u64 {
    5
}

fn default_db_max_connections() -> u32 {
    10
}

impl PipelineConfig {
    /// Load `.env` (if any), then read the process environment
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_vars(std::env::vars())
    }

    /// Read configuration from explicit `(NAME, value)` pairs
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Channel settings for the NATS provider
    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig::for_queue(self.nats_url.clone(), self.queue_name.clone())
    }

    /// Consumer settings
    ///
    /// The broker allows one delivery beyond the evaluator's budget, so a
    /// message whose last budgeted delivery went unsettled (a failed
    /// settlement or a crashed worker) still reaches the dead-letter path.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            max_deliver: (self.max_deliver > 0).then(|| self.max_deliver as i64 + 1),
            max_ack_pending: Some(1),
            ack_wait_secs: None,
        }
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            max_deliver: self.max_deliver,
            retry_backoff: BackoffPolicy {
                base_delay_ms: self.retry_base_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
            },
            ..Default::default()
        }
    }

    pub fn outbox_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_interval_secs.max(1))
    }

    /// Base log level, overridden by `RUST_LOG`
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
