//! Dead-letter path for messages the evaluator gives up on
//!
//! A message lands here when evaluation fails permanently (malformed
//! readings), when its payload does not decode as an envelope at all, or
//! when a transient failure outlives the delivery budget. The supervisor
//! terminates the channel message only after the dead-letter write
//! succeeded.

use crate::error::Result;
use crate::types::{ReceivedEnvelope, UndecodablePayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// What was withdrawn from the channel
#[derive(Debug, Clone)]
pub enum DeadLetterPayload {
    /// A decoded envelope that could not be evaluated
    Envelope(ReceivedEnvelope),
    /// Raw bytes that never decoded
    Raw(UndecodablePayload),
}

/// A message withdrawn from evaluation, with the reason
#[derive(Debug, Clone)]
pub struct DeadLetterEnvelope {
    pub payload: DeadLetterPayload,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn new(received: ReceivedEnvelope, reason: impl Into<String>) -> Self {
        Self {
            payload: DeadLetterPayload::Envelope(received),
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// Record for a payload that failed to decode; the decoder error is
    /// the reason
    pub fn undecodable(raw: UndecodablePayload) -> Self {
        Self {
            reason: format!("undecodable payload: {}", raw.error),
            payload: DeadLetterPayload::Raw(raw),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        match &self.payload {
            DeadLetterPayload::Envelope(r) => r.sequence,
            DeadLetterPayload::Raw(r) => r.sequence,
        }
    }

    pub fn num_delivered(&self) -> u64 {
        match &self.payload {
            DeadLetterPayload::Envelope(r) => r.num_delivered,
            DeadLetterPayload::Raw(r) => r.num_delivered,
        }
    }

    /// The decoded envelope, if there was one
    pub fn envelope(&self) -> Option<&ReceivedEnvelope> {
        match &self.payload {
            DeadLetterPayload::Envelope(r) => Some(r),
            DeadLetterPayload::Raw(_) => None,
        }
    }
}

/// Sink for dead-lettered messages
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Record a dead-lettered envelope
    ///
    /// An error here keeps the message on the channel for redelivery.
    async fn handle(&self, dead: DeadLetterEnvelope) -> Result<()>;

    /// Number of envelopes currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent entries first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEnvelope>>;
}

/// Bounded in-memory dead-letter ring; the oldest entries fall off
pub struct MemoryDlqHandler {
    entries: RwLock<VecDeque<DeadLetterEnvelope>>,
    capacity: usize,
}

impl MemoryDlqHandler {
    /// `capacity == 0` keeps everything
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, dead: DeadLetterEnvelope) -> Result<()> {
        let envelope = dead.envelope().map(|r| &r.envelope);
        tracing::warn!(
            event_id = ?envelope.and_then(|e| e.event_id),
            event_type = envelope.map_or("-", |e| e.event_type.as_str()),
            sequence = dead.sequence(),
            num_delivered = dead.num_delivered(),
            reason = %dead.reason,
            "Message dead-lettered"
        );

        let mut entries = self.entries.write().await;
        entries.push_back(dead);
        while self.capacity > 0 && entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEnvelope>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether this delivery used up the attempt budget (`0` = unlimited)
pub fn should_dead_letter(received: &ReceivedEnvelope, max_deliver: u64) -> bool {
    max_deliver > 0 && received.num_delivered >= max_deliver
}
