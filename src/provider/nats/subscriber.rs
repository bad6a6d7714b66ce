//! NATS JetStream subscription: pull messages with manual settlement

use crate::error::{PipelineError, Result};
use crate::provider::{Delivery, Pending, Subscription};
use crate::types::{Envelope, ReceivedEnvelope, UndecodablePayload};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;

/// Subscription over a durable JetStream pull consumer
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    stream: String,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, stream: String) -> Self {
        Self { messages, stream }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let msg = match self.messages.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                return Err(PipelineError::Consumer(format!(
                    "Failed to pull message: {}",
                    e
                )))
            }
            None => return Ok(None),
        };

        let (sequence, num_delivered) = match msg.info() {
            Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
            Err(e) => {
                tracing::warn!(error = %e, "Message without JetStream metadata");
                (0, 1)
            }
        };
        let decoded = serde_json::from_slice::<Envelope>(&msg.payload);

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let nak_msg = msg.clone();
        let term_msg = msg.clone();

        let pending = Pending::new(
            (),
            move || {
                async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| PipelineError::Ack(e.to_string()))
                }
                .boxed()
            },
            move |delay| {
                async move {
                    nak_msg
                        .ack_with(AckKind::Nak(delay))
                        .await
                        .map_err(|e| PipelineError::Ack(format!("nak failed: {}", e)))
                }
                .boxed()
            },
            move || {
                async move {
                    term_msg
                        .ack_with(AckKind::Term)
                        .await
                        .map_err(|e| PipelineError::Ack(format!("term failed: {}", e)))
                }
                .boxed()
            },
        );

        let stream = self.stream.clone();
        let delivery = match decoded {
            Ok(envelope) => Delivery::Envelope(pending.map(|()| ReceivedEnvelope {
                envelope,
                sequence,
                num_delivered,
                stream,
            })),
            Err(e) => {
                tracing::warn!(sequence, error = %e, "Undecodable message");
                Delivery::Undecodable(pending.map(|()| UndecodablePayload {
                    payload: msg.payload.to_vec(),
                    error: e.to_string(),
                    sequence,
                    num_delivered,
                    stream,
                }))
            }
        };
        Ok(Some(delivery))
    }
}
