//! NATS JetStream client: connect, declare, publish, subscribe

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{PipelineError, Result};
use crate::types::{Envelope, PublishOptions, SubscribeOptions};
use async_nats::jetstream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Holds one connection for the lifetime of the process; publishes from
/// concurrent ingestions share it.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and declare the durable stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| PipelineError::ChannelUnavailable(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish an envelope, returning the JetStream sequence number
    pub async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.publish_with_options(envelope, &PublishOptions::default())
            .await
    }

    /// Publish an envelope with options (dedup, timeout)
    pub async fn publish_with_options(
        &self,
        envelope: &Envelope,
        opts: &PublishOptions,
    ) -> Result<u64> {
        let payload = serde_json::to_vec(envelope)?;
        let subject = self.config.subject.clone();

        let mut headers = async_nats::HeaderMap::new();
        if let Some(ref msg_id) = opts.msg_id {
            headers.insert("Nats-Msg-Id", msg_id.as_str());
        }

        let ack_fut = if headers.is_empty() {
            self.jetstream
                .publish(subject.clone(), payload.into())
                .await
        } else {
            self.jetstream
                .publish_with_headers(subject.clone(), headers, payload.into())
                .await
        }
        .map_err(|e| PipelineError::Publish {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;

        let timeout_secs = opts
            .timeout_secs
            .unwrap_or(self.config.request_timeout_secs);
        let ack = tokio::time::timeout(Duration::from_secs(timeout_secs), ack_fut)
            .await
            .map_err(|_| {
                PipelineError::Timeout(format!(
                    "Publish ack timed out after {}s for subject '{}'",
                    timeout_secs, subject
                ))
            })?
            .map_err(|e| PipelineError::Publish {
                subject: subject.clone(),
                reason: format!("ack failed: {}", e),
            })?;

        if ack.duplicate {
            tracing::debug!(
                event_id = ?envelope.event_id,
                sequence = ack.sequence,
                "Duplicate publish suppressed by broker"
            );
        } else {
            tracing::debug!(
                event_id = ?envelope.event_id,
                subject = %subject,
                sequence = ack.sequence,
                "Envelope published"
            );
        }

        Ok(ack.sequence)
    }

    /// Create or attach to a durable pull consumer with explicit acks
    pub async fn subscribe_durable(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<NatsSubscription> {
        let config = build_consumer_config(&self.config.subject, consumer_name, opts);

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(consumer_name, config)
            .await
            .map_err(|e| {
                PipelineError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            PipelineError::Consumer(format!(
                "Failed to open message stream for '{}': {}",
                consumer_name, e
            ))
        })?;

        tracing::info!(
            consumer = consumer_name,
            subject = %self.config.subject,
            max_deliver = ?opts.max_deliver,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(
            messages,
            self.config.stream_name.clone(),
        ))
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream.info().await.map_err(|e| {
            PipelineError::ChannelUnavailable(format!("Failed to get stream info: {}", e))
        })?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Build a JetStream pull consumer config from SubscribeOptions
fn build_consumer_config(
    filter_subject: &str,
    durable_name: &str,
    opts: &SubscribeOptions,
) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(durable_name.to_string()),
        filter_subject: filter_subject.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: jetstream::consumer::DeliverPolicy::All,
        max_deliver: opts.max_deliver.unwrap_or(0),
        max_ack_pending: opts.max_ack_pending.unwrap_or(0),
        ack_wait: opts
            .ack_wait_secs
            .map(Duration::from_secs)
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the work-queue stream exists; repeated declarations are no-ops
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: vec![config.subject.clone()],
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        PipelineError::ChannelUnavailable(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::info!(
        stream = %config.stream_name,
        subject = %config.subject,
        "JetStream stream ready"
    );

    Ok(stream)
}
