//! # iot-alerting
//!
//! Ingest IoT device events, deliver them through a durable channel, and
//! raise alerts when per-event-type thresholds are crossed.
//!
//! ## Overview
//!
//! ```text
//! Event ─▶ EventIngestor ─▶ EventStore (outbox) ─▶ ChannelProvider
//!              │                                        │
//!        DeviceDirectory ◀──────── RuleEvaluator ◀──────┘
//!                                        │
//!                                   AlertStore / DlqHandler
//! ```
//!
//! Every collaborator is a trait object passed in at construction, so the
//! same pipeline runs on NATS + Redis + Postgres in production and on the
//! in-memory implementations in tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use iot_alerting::{
//!     Event, EventIngestor, EvaluatorConfig, MemoryDirectory, MemoryDlqHandler,
//!     MemoryProvider, MemoryStore, RuleEvaluator,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> iot_alerting::Result<()> {
//! let channel = Arc::new(MemoryProvider::default());
//! let directory = Arc::new(MemoryDirectory::new());
//! let store = Arc::new(MemoryStore::new());
//!
//! let ingestor = EventIngestor::new(channel.clone(), directory.clone(), store.clone());
//! ingestor
//!     .submit(
//!         Event::new("11:22:33:44:55:66", "speed_violation")
//!             .with_metadata("speed_kmh", 120)
//!             .with_metadata("location", "gate-1"),
//!     )
//!     .await?;
//!
//! let evaluator = RuleEvaluator::new(
//!     directory,
//!     store,
//!     Arc::new(MemoryDlqHandler::default()),
//!     EvaluatorConfig::default(),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **channel** - `provider::nats` (JetStream work queue) or `provider::memory`
//! - **directory** - `directory::redis` or `MemoryDirectory`
//! - **storage** - `storage::postgres` or `MemoryStore`

pub mod config;
pub mod directory;
pub mod dlq;
pub mod error;
pub mod evaluator;
pub mod ingest;
pub mod provider;
pub mod rules;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-export core types
pub use error::{PipelineError, Result};
pub use types::{
    Alert, AlertQuery, DeviceClassification, DeviceId, Envelope, Event, EventQuery, Metadata,
    NewAlert, PublishOptions, ReceivedEnvelope, StoredEvent, SubscribeOptions, UndecodablePayload,
};

pub use config::PipelineConfig;
pub use directory::{
    BackoffPolicy, ConnectionState, DeviceDirectory, MemoryDirectory, RedisDirectory,
};
pub use dlq::{DeadLetterEnvelope, DeadLetterPayload, DlqHandler, MemoryDlqHandler};
pub use evaluator::{Disposition, EvaluatorConfig, EvaluatorStats, RuleEvaluator};
pub use ingest::EventIngestor;
pub use provider::{
    ChannelInfo, ChannelProvider, Delivery, Pending, PendingEnvelope, PendingPayload, Subscription,
};
pub use rules::AlertDraft;
pub use storage::{AlertStore, EventStore, MemoryStore, PostgresStore};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsConfig, NatsProvider, StorageType};
