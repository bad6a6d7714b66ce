//! NATS JetStream channel provider
//!
//! Implements `ChannelProvider` using a JetStream work-queue stream for
//! persistent, at-least-once envelope delivery.

mod client;
mod config;
mod subscriber;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{ChannelInfo, ChannelProvider, Subscription};
use crate::types::{Envelope, PublishOptions, SubscribeOptions};
use async_trait::async_trait;

/// NATS JetStream channel provider
///
/// Wraps `NatsClient` and implements the `ChannelProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and declare the queue stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl ChannelProvider for NatsProvider {
    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.client.publish(envelope).await
    }

    async fn publish_with_options(
        &self,
        envelope: &Envelope,
        opts: &PublishOptions,
    ) -> Result<u64> {
        self.client.publish_with_options(envelope, opts).await
    }

    async fn subscribe_durable(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe_durable(consumer_name, opts).await?;
        Ok(Box::new(sub))
    }

    async fn info(&self) -> Result<ChannelInfo> {
        let info = self.client.stream_info().await?;
        Ok(ChannelInfo {
            provider: "nats".to_string(),
            messages: info.messages,
            bytes: info.bytes,
            consumers: info.consumer_count,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}
