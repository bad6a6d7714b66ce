//! Event and alert persistence
//!
//! The ingestor writes events through `EventStore`; the evaluator writes
//! alerts through `AlertStore`. Both are read by the query collaborators.

use crate::error::Result;
use crate::types::{Alert, AlertQuery, Event, EventQuery, NewAlert, StoredEvent};
use async_trait::async_trait;
use tokio::sync::RwLock;

pub mod postgres;

pub use postgres::PostgresStore;

/// Durable event table with an outbox flag
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event as not yet published, assigning its id
    async fn insert_event(&self, event: &Event) -> Result<StoredEvent>;

    /// Mark an event as delivered to the channel
    async fn mark_published(&self, event_id: i64) -> Result<()>;

    /// Pending events in id order, at most `limit`
    async fn unpublished_events(&self, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Events matching the query, in id order
    async fn list_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>>;
}

/// Durable alert table
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persist an alert
    ///
    /// Returns `None` when an alert for the same `source_event_id` already
    /// exists; alerts without a source are always written.
    async fn insert_alert(&self, alert: &NewAlert) -> Result<Option<Alert>>;

    /// Alerts matching the query, in id order
    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;
}

#[derive(Default)]
struct Tables {
    events: Vec<StoredEvent>,
    alerts: Vec<Alert>,
}

/// In-memory store for development and testing
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> Result<StoredEvent> {
        let mut tables = self.tables.write().await;
        let stored = StoredEvent {
            id: tables.events.len() as i64 + 1,
            device_id: event.device_id.clone(),
            timestamp: event.timestamp,
            event_type: event.event_type.clone(),
            metadata: event.metadata.clone(),
            published: false,
        };
        tables.events.push(stored.clone());
        Ok(stored)
    }

    async fn mark_published(&self, event_id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(event) = tables.events.iter_mut().find(|e| e.id == event_id) {
            event.published = true;
        }
        Ok(())
    }

    async fn unpublished_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| !e.published)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &NewAlert) -> Result<Option<Alert>> {
        let mut tables = self.tables.write().await;

        if let Some(source) = alert.source_event_id {
            if tables
                .alerts
                .iter()
                .any(|a| a.source_event_id == Some(source))
            {
                return Ok(None);
            }
        }

        let stored = Alert {
            id: tables.alerts.len() as i64 + 1,
            source_event_id: alert.source_event_id,
            event_type: alert.event_type.clone(),
            description: alert.description.clone(),
            metadata: alert.metadata.clone(),
            created_at: alert.created_at,
        };
        tables.alerts.push(stored.clone());
        Ok(Some(stored))
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let tables = self.tables.read().await;
        Ok(tables
            .alerts
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect())
    }
}
