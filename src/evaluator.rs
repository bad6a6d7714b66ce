//! Rule evaluator: the consuming side of the pipeline
//!
//! One worker drains a durable subscription strictly in delivery order.
//! Each message is settled only after its outcome is durable:
//!
//! - evaluation and alert write committed → `ack`
//! - transient failure with deliveries left → `nak` with backoff
//! - permanent failure or budget spent → dead-letter, then `term`
//! - payload that does not decode → dead-letter, then `term`
//!
//! A failed dead-letter write falls back to `nak`, so a message is never
//! dropped without a record.

use crate::directory::{BackoffPolicy, DeviceDirectory};
use crate::dlq::{should_dead_letter, DeadLetterEnvelope, DlqHandler};
use crate::error::{PipelineError, Result};
use crate::provider::{Delivery, Pending, PendingEnvelope, PendingPayload, Subscription};
use crate::rules;
use crate::storage::AlertStore;
use crate::types::{Alert, Envelope, NewAlert};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delivery budget and redelivery backoff
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Deliveries before a transiently failing envelope is dead-lettered
    /// (`0` = retry forever)
    pub max_deliver: u64,

    /// Delay before redelivery, indexed by completed attempts
    pub retry_backoff: BackoffPolicy,

    /// Pause after a failed pull before trying again
    pub pull_error_delay: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            retry_backoff: BackoffPolicy {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
            },
            pull_error_delay: Duration::from_secs(1),
        }
    }
}

/// How a message was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Processed and acknowledged; carries the alert if one was created
    Acked { alert: Option<Alert> },
    /// Handed back to the channel for another attempt
    Retried { delay: Duration },
    /// Recorded in the dead-letter handler and terminated
    DeadLettered { reason: String },
    /// Settlement itself failed; the channel redelivers after its ack wait
    Unsettled { reason: String },
}

/// Counters reported when the run loop exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluatorStats {
    pub processed: u64,
    pub alerts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub unsettled: u64,
}

impl EvaluatorStats {
    fn record(&mut self, disposition: &Disposition) {
        self.processed += 1;
        match disposition {
            Disposition::Acked { alert } => {
                if alert.is_some() {
                    self.alerts += 1;
                }
            }
            Disposition::Retried { .. } => self.retried += 1,
            Disposition::DeadLettered { .. } => self.dead_lettered += 1,
            Disposition::Unsettled { .. } => self.unsettled += 1,
        }
    }
}

/// Applies the rule table to delivered envelopes and records alerts
pub struct RuleEvaluator {
    directory: Arc<dyn DeviceDirectory>,
    alerts: Arc<dyn AlertStore>,
    dlq: Arc<dyn DlqHandler>,
    config: EvaluatorConfig,
}

impl RuleEvaluator {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        alerts: Arc<dyn AlertStore>,
        dlq: Arc<dyn DlqHandler>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            directory,
            alerts,
            dlq,
            config,
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    fn redelivery_delay(&self, num_delivered: u64) -> Duration {
        let attempt = num_delivered.saturating_sub(1).min(u32::MAX as u64) as u32;
        self.config.retry_backoff.delay_for_attempt(attempt)
    }

    /// Evaluate one envelope and persist the alert it raises
    ///
    /// Returns `None` when no rule fired or when this event already has an
    /// alert (a redelivery).
    pub async fn handle(&self, envelope: &Envelope) -> Result<Option<Alert>> {
        let Some(draft) = rules::evaluate(envelope, self.directory.as_ref()).await? else {
            tracing::debug!(
                event_id = ?envelope.event_id,
                event_type = %envelope.event_type,
                "No rule fired"
            );
            return Ok(None);
        };

        let new_alert = NewAlert {
            source_event_id: envelope.event_id,
            event_type: draft.event_type,
            description: draft.description,
            metadata: draft.metadata,
            created_at: Utc::now(),
        };

        match self.alerts.insert_alert(&new_alert).await? {
            Some(alert) => {
                tracing::warn!(
                    alert_id = alert.id,
                    event_id = ?envelope.event_id,
                    device_id = %envelope.device_id,
                    description = %alert.description,
                    "Alert raised"
                );
                Ok(Some(alert))
            }
            None => {
                tracing::info!(
                    event_id = ?envelope.event_id,
                    "Alert already recorded, skipping duplicate delivery"
                );
                Ok(None)
            }
        }
    }

    /// Handle one delivery and settle it according to the outcome
    pub async fn process(&self, pending: PendingEnvelope) -> Disposition {
        let outcome = self.handle(&pending.received.envelope).await;

        let err = match outcome {
            Ok(alert) => {
                return match pending.ack().await {
                    Ok(()) => Disposition::Acked { alert },
                    Err(e) => unsettled("ack", e),
                };
            }
            Err(e) => e,
        };

        let received = pending.received.clone();
        let delay = self.redelivery_delay(received.num_delivered);

        if err.is_retryable() && !should_dead_letter(&received, self.config.max_deliver) {
            tracing::warn!(
                event_id = ?received.envelope.event_id,
                sequence = received.sequence,
                num_delivered = received.num_delivered,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Evaluation failed, scheduling redelivery"
            );
            return match pending.nak(Some(delay)).await {
                Ok(()) => Disposition::Retried { delay },
                Err(e) => unsettled("nak", e),
            };
        }

        let reason = if err.is_retryable() {
            format!("gave up after {} deliveries: {}", received.num_delivered, err)
        } else {
            err.to_string()
        };

        let dead = DeadLetterEnvelope::new(received, reason);
        self.dead_letter(pending, dead, delay).await
    }

    /// Dead-letter a payload that never decoded as an envelope
    pub async fn reject(&self, pending: PendingPayload) -> Disposition {
        let delay = self.redelivery_delay(pending.received.num_delivered);
        let dead = DeadLetterEnvelope::undecodable(pending.received.clone());
        self.dead_letter(pending, dead, delay).await
    }

    /// Route any delivery to `process` or `reject`
    pub async fn dispatch(&self, delivery: Delivery) -> Disposition {
        match delivery {
            Delivery::Envelope(pending) => self.process(pending).await,
            Delivery::Undecodable(pending) => self.reject(pending).await,
        }
    }

    /// Record `dead`, then terminate; a failed record write naks instead
    async fn dead_letter<T>(
        &self,
        pending: Pending<T>,
        dead: DeadLetterEnvelope,
        delay: Duration,
    ) -> Disposition {
        let reason = dead.reason.clone();
        let sequence = dead.sequence();

        if let Err(dlq_err) = self.dlq.handle(dead).await {
            tracing::error!(
                sequence,
                error = %dlq_err,
                "Dead-letter write failed, keeping message on the channel"
            );
            return match pending.nak(Some(delay)).await {
                Ok(()) => Disposition::Retried { delay },
                Err(e) => unsettled("nak", e),
            };
        }

        match pending.term().await {
            Ok(()) => Disposition::DeadLettered { reason },
            Err(e) => unsettled("term", e),
        }
    }

    /// Consume until the subscription ends or `cancel` fires
    ///
    /// Cancellation is observed between messages only; a message already
    /// received is processed and settled first.
    pub async fn run(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: CancellationToken,
    ) -> Result<EvaluatorStats> {
        tracing::info!(max_deliver = self.config.max_deliver, "Rule evaluator started");
        let mut stats = EvaluatorStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested, stopping rule evaluator");
                    break;
                }
                next = subscription.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let disposition = self.dispatch(delivery).await;
                    stats.record(&disposition);
                }
                Ok(None) => {
                    tracing::info!("Subscription closed");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(error = %e, "Failed to pull next envelope");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.pull_error_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            processed = stats.processed,
            alerts = stats.alerts,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "Rule evaluator stopped"
        );
        Ok(stats)
    }
}

fn unsettled(op: &str, e: PipelineError) -> Disposition {
    tracing::error!(error = %e, "Failed to {} message", op);
    Disposition::Unsettled {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::dlq::MemoryDlqHandler;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::ChannelProvider;
    use crate::storage::MemoryStore;
    use crate::types::{AlertQuery, Metadata, SubscribeOptions};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    struct Harness {
        provider: MemoryProvider,
        store: Arc<MemoryStore>,
        dlq: Arc<MemoryDlqHandler>,
        evaluator: RuleEvaluator,
    }

    fn harness_with(alerts: Option<Arc<dyn AlertStore>>, max_deliver: u64) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let dlq = Arc::new(MemoryDlqHandler::default());
        let alerts: Arc<dyn AlertStore> = match alerts {
            Some(alerts) => alerts,
            None => store.clone(),
        };
        let evaluator = RuleEvaluator::new(
            Arc::new(MemoryDirectory::new()),
            alerts,
            dlq.clone(),
            EvaluatorConfig {
                max_deliver,
                ..Default::default()
            },
        );
        Harness {
            provider: MemoryProvider::default(),
            store,
            dlq,
            evaluator,
        }
    }

    fn envelope(event_id: i64, event_type: &str, metadata: serde_json::Value) -> Envelope {
        Envelope {
            event_id: Some(event_id),
            device_id: "11:22:33:44:55:66".to_string(),
            event_type: event_type.to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_else(Metadata::new),
        }
    }

    async fn pull(sub: &mut Box<dyn Subscription>) -> PendingEnvelope {
        sub.next().await.unwrap().unwrap().into_envelope().unwrap()
    }

    struct FailingAlerts;

    #[async_trait]
    impl AlertStore for FailingAlerts {
        async fn insert_alert(&self, _alert: &NewAlert) -> Result<Option<Alert>> {
            Err(PipelineError::Persistence("connection reset".into()))
        }

        async fn list_alerts(&self, _query: &AlertQuery) -> Result<Vec<Alert>> {
            Ok(Vec::new())
        }
    }

    /// Holds every insert until released
    struct GatedAlerts {
        inner: Arc<MemoryStore>,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl AlertStore for GatedAlerts {
        async fn insert_alert(&self, alert: &NewAlert) -> Result<Option<Alert>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.insert_alert(alert).await
        }

        async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
            self.inner.list_alerts(query).await
        }
    }

    #[tokio::test]
    async fn test_handle_raises_alert_with_envelope_metadata() {
        let h = harness_with(None, 5);
        let env = envelope(1, "speed_violation", json!({"speed_kmh": 120, "location": "gate-1"}));

        let alert = h.evaluator.handle(&env).await.unwrap().unwrap();
        assert_eq!(alert.description, "Speed violation detected: 120 km/h");
        assert_eq!(alert.source_event_id, Some(1));
        assert_eq!(alert.metadata, env.metadata);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_yields_one_alert() {
        let h = harness_with(None, 5);
        let env = envelope(3, "motion_detected", json!({"confidence": 0.97}));

        assert!(h.evaluator.handle(&env).await.unwrap().is_some());
        assert!(h.evaluator.handle(&env).await.unwrap().is_none());

        let alerts = h.store.list_alerts(&AlertQuery::default()).await.unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_process_acks_after_commit() {
        let h = harness_with(None, 5);
        h.provider
            .publish(&envelope(1, "speed_violation", json!({"speed_kmh": 150})))
            .await
            .unwrap();
        let mut sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let pending = pull(&mut sub).await;
        match h.evaluator.process(pending).await {
            Disposition::Acked { alert } => assert!(alert.is_some()),
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_dead_lettered() {
        let h = harness_with(None, 5);
        h.provider
            .publish(&envelope(1, "speed_violation", json!({"speed_kmh": "fast"})))
            .await
            .unwrap();
        let mut sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let pending = pull(&mut sub).await;
        assert!(matches!(
            h.evaluator.process(pending).await,
            Disposition::DeadLettered { .. }
        ));
        assert_eq!(h.dlq.count().await.unwrap(), 1);
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_then_dead_letters() {
        let h = harness_with(Some(Arc::new(FailingAlerts) as Arc<dyn AlertStore>), 2);
        h.provider
            .publish(&envelope(1, "speed_violation", json!({"speed_kmh": 150})))
            .await
            .unwrap();
        let mut sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let first = pull(&mut sub).await;
        assert_eq!(
            h.evaluator.process(first).await,
            Disposition::Retried {
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(h.dlq.count().await.unwrap(), 0);

        let second = pull(&mut sub).await;
        assert_eq!(second.received.num_delivered, 2);
        match h.evaluator.process(second).await {
            Disposition::DeadLettered { reason } => {
                assert!(reason.starts_with("gave up after 2 deliveries"))
            }
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness_with(None, 5);
        for id in 1..=3 {
            h.provider
                .publish(&envelope(id, "speed_violation", json!({"speed_kmh": 100 + id})))
                .await
                .unwrap();
        }
        let sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let store = h.store.clone();
        tokio::spawn(async move {
            loop {
                let count = store.list_alerts(&AlertQuery::default()).await.unwrap().len();
                if count == 3 {
                    stopper.cancel();
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let stats = h.evaluator.run(sub, cancel).await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.alerts, 3);
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let h = harness_with(None, 5);
        h.provider.publish_raw(b"{\"device_id\": 42".to_vec()).await.unwrap();
        let mut sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let delivery = sub.next().await.unwrap().unwrap();
        match h.evaluator.dispatch(delivery).await {
            Disposition::DeadLettered { reason } => {
                assert!(reason.starts_with("undecodable payload"))
            }
            other => panic!("unexpected disposition: {:?}", other),
        }

        let dead = h.dlq.list(1).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].envelope().is_none());
        match &dead[0].payload {
            crate::dlq::DeadLetterPayload::Raw(raw) => {
                assert_eq!(raw.payload, b"{\"device_id\": 42")
            }
            other => panic!("expected raw payload, got {:?}", other),
        }
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_processing_settles_in_flight_message() {
        let gate = Arc::new(GatedAlerts {
            inner: Arc::new(MemoryStore::new()),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let h = harness_with(Some(gate.clone() as Arc<dyn AlertStore>), 5);
        for id in 1..=2 {
            h.provider
                .publish(&envelope(id, "speed_violation", json!({"speed_kmh": 150})))
                .await
                .unwrap();
        }
        let sub = h
            .provider
            .subscribe_durable("rules", &SubscribeOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let driver = async {
            gate.entered.notified().await;
            cancel.cancel();
            gate.release.notify_one();
        };
        let (stats, ()) = tokio::join!(h.evaluator.run(sub, cancel.clone()), driver);

        let stats = stats.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.alerts, 1);
        let alerts = gate.list_alerts(&AlertQuery::default()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source_event_id, Some(1));
        // The first message was acked; the second was never pulled
        assert_eq!(h.provider.info().await.unwrap().messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_past_budget_is_dead_lettered() {
        let h = harness_with(Some(Arc::new(FailingAlerts) as Arc<dyn AlertStore>), 1);
        h.provider
            .publish(&envelope(1, "speed_violation", json!({"speed_kmh": 150})))
            .await
            .unwrap();
        let opts = SubscribeOptions {
            ack_wait_secs: Some(1),
            ..Default::default()
        };
        let mut sub = h.provider.subscribe_durable("rules", &opts).await.unwrap();

        // Last budgeted delivery never settled
        drop(pull(&mut sub).await);

        let spare = pull(&mut sub).await;
        assert_eq!(spare.received.num_delivered, 2);
        match h.evaluator.process(spare).await {
            Disposition::DeadLettered { reason } => {
                assert!(reason.starts_with("gave up after 2 deliveries"))
            }
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(h.dlq.count().await.unwrap(), 1);
        assert_eq!(h.provider.info().await.unwrap().messages, 0);
    }
}
