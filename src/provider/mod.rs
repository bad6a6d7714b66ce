//! Durable channel abstraction
//!
//! All channel backends (NATS JetStream, in-memory) implement
//! `ChannelProvider` so the ingestor and evaluator never depend on a
//! specific broker. Delivery is at-least-once: a message is redelivered
//! until it is acknowledged or terminated.

use crate::error::Result;
use crate::types::{
    Envelope, PublishOptions, ReceivedEnvelope, SubscribeOptions, UndecodablePayload,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Core trait for channel backends
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Publish an envelope with persistent delivery, returning the
    /// provider-assigned sequence number
    async fn publish(&self, envelope: &Envelope) -> Result<u64>;

    /// Publish an envelope with provider-specific options
    ///
    /// Default implementation ignores options and delegates to `publish()`.
    /// Providers that support deduplication or custom timeouts should
    /// override this.
    async fn publish_with_options(
        &self,
        envelope: &Envelope,
        _opts: &PublishOptions,
    ) -> Result<u64> {
        self.publish(envelope).await
    }

    /// Create (or attach to) a durable consumer on the queue
    ///
    /// Subscriptions with the same consumer name compete for messages.
    async fn subscribe_durable(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>>;

    /// Get channel info (message count, etc.)
    async fn info(&self) -> Result<ChannelInfo>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check; true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Pull-side handle yielding one message at a time in queue order
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next delivery; `None` means the subscription ended
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// One message pulled from the channel
#[derive(Debug)]
pub enum Delivery {
    /// A well-formed envelope
    Envelope(PendingEnvelope),
    /// A payload that failed to decode; still awaiting settlement
    Undecodable(PendingPayload),
}

impl Delivery {
    /// Provider-assigned sequence number
    pub fn sequence(&self) -> u64 {
        match self {
            Delivery::Envelope(p) => p.received.sequence,
            Delivery::Undecodable(p) => p.received.sequence,
        }
    }

    /// The pending envelope, or `None` for an undecodable payload
    pub fn into_envelope(self) -> Option<PendingEnvelope> {
        match self {
            Delivery::Envelope(p) => Some(p),
            Delivery::Undecodable(_) => None,
        }
    }
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;
type NakFn = Box<dyn FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send>;

/// A delivered message pending acknowledgement
///
/// Exactly one of `ack`, `nak`, or `term` should be called. Dropping the
/// value without settling leaves the message to be redelivered once the
/// provider's ack wait expires.
pub struct Pending<T> {
    /// The received message with its delivery context
    pub received: T,

    ack_fn: AckFn,
    nak_fn: NakFn,
    term_fn: AckFn,
}

/// A decoded envelope pending acknowledgement
pub type PendingEnvelope = Pending<ReceivedEnvelope>;

/// An undecodable payload pending acknowledgement
pub type PendingPayload = Pending<UndecodablePayload>;

impl<T> Pending<T> {
    /// Create a new pending message with settlement callbacks
    pub fn new(
        received: T,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce(Option<Duration>) -> BoxFuture<'static, Result<()>> + Send + 'static,
        term_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            received,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
            term_fn: Box::new(term_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge, requesting redelivery after an optional delay
    pub async fn nak(self, delay: Option<Duration>) -> Result<()> {
        (self.nak_fn)(delay).await
    }

    /// Terminate: the message is never redelivered
    pub async fn term(self) -> Result<()> {
        (self.term_fn)().await
    }

    /// Swap the message body, keeping the settlement callbacks
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Pending<U> {
        Pending {
            received: f(self.received),
            ack_fn: self.ack_fn,
            nak_fn: self.nak_fn,
            term_fn: self.term_fn,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

/// Channel status information
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    /// Provider name
    pub provider: String,
    /// Messages currently stored (not yet acknowledged, for work queues)
    pub messages: u64,
    /// Total bytes used
    pub bytes: u64,
    /// Number of consumers
    pub consumers: usize,
}
