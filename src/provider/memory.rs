//! In-memory channel provider
//!
//! A single FIFO work queue held in process memory. Messages stay queued
//! until acknowledged or terminated; `nak` puts a message back at its
//! original queue position, optionally delayed. A delivery left unsettled
//! past the ack wait is redelivered. Useful for tests and single-process
//! deployments; nothing survives a restart.

use crate::error::{PipelineError, Result};
use crate::provider::{ChannelInfo, ChannelProvider, Delivery, Pending, Subscription};
use crate::types::{
    Envelope, PublishOptions, ReceivedEnvelope, SubscribeOptions, UndecodablePayload,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Configuration for the in-memory provider
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Queue name reported in delivery context
    pub stream_name: String,

    /// Number of recent message IDs remembered for deduplication
    pub dedup_window: usize,

    /// Redelivery timeout for unsettled messages, unless the subscription
    /// sets `ack_wait_secs`
    pub ack_wait: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stream_name: "iot_events".to_string(),
            dedup_window: 10_000,
            ack_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    payload: Vec<u8>,
    num_delivered: u64,
    available_at: Option<Instant>,
    ack_deadline: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    last_sequence: u64,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, StoredMessage>,
    seen_ids: HashMap<String, u64>,
    seen_order: VecDeque<String>,
    consumers: HashSet<String>,
}

impl QueueState {
    /// Re-queue a message at its sequence position so FIFO order holds
    fn requeue(&mut self, mut message: StoredMessage, delay: Option<Duration>) {
        message.available_at = delay.map(|d| Instant::now() + d);
        message.ack_deadline = None;
        let pos = self
            .ready
            .iter()
            .position(|m| m.sequence > message.sequence)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, message);
    }

    /// Return in-flight messages whose ack wait has passed to the queue
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .values()
            .filter(|m| m.ack_deadline.map_or(false, |t| t <= now))
            .map(|m| m.sequence)
            .collect();

        for sequence in expired {
            if let Some(message) = self.in_flight.remove(&sequence) {
                tracing::debug!(
                    sequence,
                    num_delivered = message.num_delivered,
                    "Ack wait expired, redelivering"
                );
                self.requeue(message, None);
            }
        }
    }

    /// Earliest instant at which a message may become deliverable
    fn next_wake(&self) -> Option<Instant> {
        self.ready
            .iter()
            .filter_map(|m| m.available_at)
            .chain(self.in_flight.values().filter_map(|m| m.ack_deadline))
            .min()
    }
}

struct Inner {
    config: MemoryConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-memory channel provider
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct MemoryProvider {
    inner: Arc<Inner>,
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue an arbitrary payload, bypassing envelope encoding
    ///
    /// Subscribers see payloads that do not decode as
    /// `Delivery::Undecodable`.
    pub async fn publish_raw(&self, payload: Vec<u8>) -> Result<u64> {
        self.enqueue(payload, None).await
    }

    async fn enqueue(&self, payload: Vec<u8>, msg_id: Option<&str>) -> Result<u64> {
        let mut state = self.inner.state.lock().await;

        if let Some(id) = msg_id {
            if let Some(&sequence) = state.seen_ids.get(id) {
                tracing::debug!(msg_id = id, sequence, "Duplicate publish suppressed");
                return Ok(sequence);
            }
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state.ready.push_back(StoredMessage {
            sequence,
            payload,
            num_delivered: 0,
            available_at: None,
            ack_deadline: None,
        });

        if let Some(id) = msg_id {
            state.seen_ids.insert(id.to_string(), sequence);
            state.seen_order.push_back(id.to_string());
            while state.seen_order.len() > self.inner.config.dedup_window {
                if let Some(old) = state.seen_order.pop_front() {
                    state.seen_ids.remove(&old);
                }
            }
        }
        drop(state);

        self.inner.notify.notify_one();
        Ok(sequence)
    }

    async fn publish_envelope(&self, envelope: &Envelope, msg_id: Option<&str>) -> Result<u64> {
        let payload = serde_json::to_vec(envelope)?;
        let sequence = self.enqueue(payload, msg_id).await?;
        tracing::debug!(event_id = ?envelope.event_id, sequence, "Envelope published");
        Ok(sequence)
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn publish(&self, envelope: &Envelope) -> Result<u64> {
        self.publish_envelope(envelope, None).await
    }

    async fn publish_with_options(
        &self,
        envelope: &Envelope,
        opts: &PublishOptions,
    ) -> Result<u64> {
        self.publish_envelope(envelope, opts.msg_id.as_deref()).await
    }

    async fn subscribe_durable(
        &self,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        self.inner
            .state
            .lock()
            .await
            .consumers
            .insert(consumer_name.to_string());

        let ack_wait = match opts.ack_wait_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.inner.config.ack_wait,
        };

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            ack_wait,
        }))
    }

    async fn info(&self) -> Result<ChannelInfo> {
        let state = self.inner.state.lock().await;
        let bytes = state
            .ready
            .iter()
            .chain(state.in_flight.values())
            .map(|m| m.payload.len() as u64)
            .sum();

        Ok(ChannelInfo {
            provider: "memory".to_string(),
            messages: (state.ready.len() + state.in_flight.len()) as u64,
            bytes,
            consumers: state.consumers.len(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription on the in-memory queue
pub struct MemorySubscription {
    inner: Arc<Inner>,
    ack_wait: Duration,
}

impl MemorySubscription {
    /// Settle one delivery of an in-flight message; `requeue` carries the
    /// nak delay
    ///
    /// A handle whose delivery was already reclaimed by the ack wait no
    /// longer owns the message and fails.
    fn settle(
        inner: &Arc<Inner>,
        sequence: u64,
        delivery: u64,
        requeue: Option<Option<Duration>>,
    ) -> BoxFuture<'static, Result<()>> {
        let inner = inner.clone();
        async move {
            let mut state = inner.state.lock().await;
            let owned = state
                .in_flight
                .get(&sequence)
                .map_or(false, |m| m.num_delivered == delivery);
            if !owned {
                return Err(PipelineError::Ack(format!(
                    "message {} delivery {} is not in flight",
                    sequence, delivery
                )));
            }

            if let Some(message) = state.in_flight.remove(&sequence) {
                if let Some(delay) = requeue {
                    state.requeue(message, delay);
                    drop(state);
                    inner.notify.notify_one();
                }
            }
            Ok(())
        }
        .boxed()
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let wake_at = {
                let mut state = self.inner.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                let ready_pos = state
                    .ready
                    .iter()
                    .position(|m| m.available_at.map_or(true, |t| t <= now));

                if let Some(mut message) = ready_pos.and_then(|pos| state.ready.remove(pos)) {
                    message.num_delivered += 1;
                    message.available_at = None;
                    message.ack_deadline = Some(now + self.ack_wait);

                    let sequence = message.sequence;
                    let delivery = message.num_delivered;
                    let stream = self.inner.config.stream_name.clone();

                    let inner = &self.inner;
                    let ack = Self::settle(inner, sequence, delivery, None);
                    let term = Self::settle(inner, sequence, delivery, None);
                    let nak_inner = inner.clone();
                    let pending = Pending::new(
                        (),
                        move || ack,
                        move |delay| Self::settle(&nak_inner, sequence, delivery, Some(delay)),
                        move || term,
                    );

                    let delivered = match serde_json::from_slice::<Envelope>(&message.payload) {
                        Ok(envelope) => Delivery::Envelope(pending.map(|()| ReceivedEnvelope {
                            envelope,
                            sequence,
                            num_delivered: delivery,
                            stream,
                        })),
                        Err(e) => {
                            tracing::warn!(sequence, error = %e, "Undecodable message");
                            let raw = UndecodablePayload {
                                payload: message.payload.clone(),
                                error: e.to_string(),
                                sequence,
                                num_delivered: delivery,
                                stream,
                            };
                            Delivery::Undecodable(pending.map(|()| raw))
                        }
                    };

                    state.in_flight.insert(sequence, message);
                    return Ok(Some(delivered));
                }

                state.next_wake()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn envelope(event_id: i64) -> Envelope {
        Envelope {
            event_id: Some(event_id),
            device_id: "11:22:33:44:55:66".to_string(),
            event_type: "speed_violation".to_string(),
            metadata: Metadata::new(),
        }
    }

    async fn subscription(provider: &MemoryProvider) -> Box<dyn Subscription> {
        provider
            .subscribe_durable("test", &SubscribeOptions::default())
            .await
            .unwrap()
    }

    async fn pull(sub: &mut Box<dyn Subscription>) -> crate::provider::PendingEnvelope {
        sub.next().await.unwrap().unwrap().into_envelope().unwrap()
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let provider = MemoryProvider::default();
        for id in 1..=3 {
            provider.publish(&envelope(id)).await.unwrap();
        }

        let mut sub = subscription(&provider).await;
        for expected in 1..=3 {
            let pending = pull(&mut sub).await;
            assert_eq!(pending.received.envelope.event_id, Some(expected));
            assert_eq!(pending.received.num_delivered, 1);
            pending.ack().await.unwrap();
        }

        assert_eq!(provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_nak_redelivers_in_order() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();
        provider.publish(&envelope(2)).await.unwrap();

        let mut sub = subscription(&provider).await;
        let first = pull(&mut sub).await;
        first.nak(None).await.unwrap();

        let again = pull(&mut sub).await;
        assert_eq!(again.received.envelope.event_id, Some(1));
        assert_eq!(again.received.num_delivered, 2);
        again.ack().await.unwrap();

        let second = pull(&mut sub).await;
        assert_eq!(second.received.envelope.event_id, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_with_delay_lets_later_messages_through() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();
        provider.publish(&envelope(2)).await.unwrap();

        let mut sub = subscription(&provider).await;
        let first = pull(&mut sub).await;
        first.nak(Some(Duration::from_secs(10))).await.unwrap();

        let second = pull(&mut sub).await;
        assert_eq!(second.received.envelope.event_id, Some(2));
        second.ack().await.unwrap();

        let redelivered = pull(&mut sub).await;
        assert_eq!(redelivered.received.envelope.event_id, Some(1));
        assert_eq!(redelivered.received.num_delivered, 2);
    }

    #[tokio::test]
    async fn test_term_drops_message() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();

        let mut sub = subscription(&provider).await;
        pull(&mut sub).await.term().await.unwrap();
        assert_eq!(provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_msg_id_deduplication() {
        let provider = MemoryProvider::default();
        let env = envelope(9);
        let opts = PublishOptions::for_envelope(&env);

        let first = provider.publish_with_options(&env, &opts).await.unwrap();
        let second = provider.publish_with_options(&env, &opts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.info().await.unwrap().messages, 1);

        // Plain publish bypasses deduplication
        provider.publish(&env).await.unwrap();
        assert_eq!(provider.info().await.unwrap().messages, 2);
    }

    #[tokio::test]
    async fn test_dedup_window_is_bounded() {
        let provider = MemoryProvider::new(MemoryConfig {
            dedup_window: 1,
            ..Default::default()
        });
        let a = envelope(1);
        let b = envelope(2);

        for env in [&a, &b, &a] {
            provider
                .publish_with_options(env, &PublishOptions::for_envelope(env))
                .await
                .unwrap();
        }

        assert_eq!(provider.info().await.unwrap().messages, 3);
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_publish() {
        let provider = MemoryProvider::default();
        let mut sub = subscription(&provider).await;

        let publisher = provider.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&envelope(5)).await.unwrap();
        });

        let pending = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .into_envelope()
            .unwrap();
        assert_eq!(pending.received.envelope.event_id, Some(5));
    }

    #[tokio::test]
    async fn test_double_ack_fails() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();
        let mut sub = subscription(&provider).await;
        let pending = pull(&mut sub).await;
        let sequence = pending.received.sequence;
        pending.ack().await.unwrap();

        let err = MemorySubscription::settle(&provider.inner, sequence, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ack(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_delivery_is_redelivered_after_ack_wait() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();
        let mut sub = subscription(&provider).await;

        let started = Instant::now();
        drop(pull(&mut sub).await);

        let again = tokio::time::timeout(Duration::from_secs(60), pull(&mut sub))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(again.received.envelope.event_id, Some(1));
        assert_eq!(again.received.num_delivered, 2);

        again.ack().await.unwrap();
        assert_eq!(provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimed_delivery_cannot_be_settled() {
        let provider = MemoryProvider::default();
        provider.publish(&envelope(1)).await.unwrap();
        let opts = SubscribeOptions {
            ack_wait_secs: Some(2),
            ..Default::default()
        };
        let mut sub = provider.subscribe_durable("test", &opts).await.unwrap();

        let stale = pull(&mut sub).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let current = pull(&mut sub).await;
        assert_eq!(current.received.num_delivered, 2);

        assert!(matches!(stale.ack().await, Err(PipelineError::Ack(_))));
        assert_eq!(provider.info().await.unwrap().messages, 1);
        current.ack().await.unwrap();
        assert_eq!(provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_raw_payload_surfaces_as_undecodable() {
        let provider = MemoryProvider::default();
        provider.publish_raw(b"not json".to_vec()).await.unwrap();
        provider.publish(&envelope(2)).await.unwrap();
        let mut sub = subscription(&provider).await;

        let pending = match sub.next().await.unwrap().unwrap() {
            Delivery::Undecodable(pending) => pending,
            other => panic!("expected undecodable delivery, got {:?}", other),
        };
        assert_eq!(pending.received.payload, b"not json");
        assert_eq!(pending.received.sequence, 1);
        assert!(!pending.received.error.is_empty());

        // Still queued until settled
        assert_eq!(provider.info().await.unwrap().messages, 2);
        pending.term().await.unwrap();

        let next = pull(&mut sub).await;
        assert_eq!(next.received.envelope.event_id, Some(2));
    }
}
