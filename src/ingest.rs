//! Event ingestor: the producing side of the pipeline
//!
//! `submit` validates, classifies, persists, then publishes. Events are
//! written as unpublished and flipped once the channel has accepted the
//! envelope; anything left behind by a failed publish is picked up by the
//! outbox relay.

use crate::directory::DeviceDirectory;
use crate::error::Result;
use crate::provider::ChannelProvider;
use crate::storage::EventStore;
use crate::types::{DeviceClassification, DeviceId, Event, PublishOptions, StoredEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default number of pending events republished per relay pass
pub const DEFAULT_OUTBOX_BATCH: usize = 100;

/// Accepts events and forwards them to the durable channel
pub struct EventIngestor {
    channel: Arc<dyn ChannelProvider>,
    directory: Arc<dyn DeviceDirectory>,
    events: Arc<dyn EventStore>,
    outbox_batch: usize,
}

impl EventIngestor {
    pub fn new(
        channel: Arc<dyn ChannelProvider>,
        directory: Arc<dyn DeviceDirectory>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            channel,
            directory,
            events,
            outbox_batch: DEFAULT_OUTBOX_BATCH,
        }
    }

    /// Override how many pending events one relay pass republishes
    pub fn with_outbox_batch(mut self, batch: usize) -> Self {
        self.outbox_batch = batch.max(1);
        self
    }

    /// Accept an event and return its id
    ///
    /// A malformed device id fails with `InvalidIdentifier` before any
    /// side effect. Once the event is persisted the call succeeds even if
    /// publishing fails; the relay delivers it later.
    pub async fn submit(&self, event: Event) -> Result<i64> {
        let device_id = DeviceId::parse(&event.device_id)?;

        self.ensure_classified(&device_id, &event.event_type).await?;

        let stored = self.events.insert_event(&event).await?;
        tracing::info!(
            event_id = stored.id,
            device_id = %device_id,
            event_type = %stored.event_type,
            "Event accepted"
        );

        if let Err(e) = self.publish(&stored).await {
            tracing::warn!(
                event_id = stored.id,
                error = %e,
                "Publish failed, event left in outbox"
            );
        }

        Ok(stored.id)
    }

    /// Record a classification for a device seen for the first time
    ///
    /// Existing classifications are never overwritten.
    async fn ensure_classified(&self, device_id: &DeviceId, event_type: &str) -> Result<()> {
        if self.directory.lookup(device_id.as_str()).await?.is_some() {
            return Ok(());
        }

        let classification = DeviceClassification::for_event_type(event_type);
        self.directory
            .upsert(device_id.as_str(), &classification)
            .await?;
        tracing::info!(
            device_id = %device_id,
            device_type = %classification.device_type,
            "New device classified"
        );
        Ok(())
    }

    /// Publish a stored event and flag it as delivered
    async fn publish(&self, stored: &StoredEvent) -> Result<u64> {
        let envelope = stored.envelope();
        let sequence = self
            .channel
            .publish_with_options(&envelope, &PublishOptions::for_envelope(&envelope))
            .await?;

        if let Err(e) = self.events.mark_published(stored.id).await {
            // The relay republishes it; the channel drops the duplicate
            tracing::error!(event_id = stored.id, error = %e, "Failed to mark event published");
        }

        tracing::debug!(event_id = stored.id, sequence, "Envelope published");
        Ok(sequence)
    }

    /// Republish pending events in id order, returning how many went out
    ///
    /// Stops at the first publish failure so order is kept.
    pub async fn flush_outbox(&self, limit: usize) -> Result<usize> {
        let pending = self.events.unpublished_events(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut published = 0;
        for stored in &pending {
            match self.publish(stored).await {
                Ok(_) => published += 1,
                Err(e) => {
                    tracing::warn!(
                        event_id = stored.id,
                        remaining = pending.len() - published,
                        error = %e,
                        "Outbox flush interrupted"
                    );
                    break;
                }
            }
        }

        if published > 0 {
            tracing::info!(published, "Outbox flushed");
        }
        Ok(published)
    }

    /// Flush the outbox every `interval` until cancelled
    pub async fn run_outbox_relay(&self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Outbox relay started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_outbox(self.outbox_batch).await {
                        tracing::error!(error = %e, "Outbox relay pass failed");
                    }
                }
            }
        }

        tracing::info!("Outbox relay stopped");
    }
}
