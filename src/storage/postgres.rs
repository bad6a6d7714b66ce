//! Postgres-backed event and alert store
//!
//! Metadata is stored as `JSON` (not `JSONB`) so key order survives the
//! round trip.

use super::{AlertStore, EventStore};
use crate::error::{PipelineError, Result};
use crate::types::{Alert, AlertQuery, Event, EventQuery, Metadata, NewAlert, StoredEvent};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;

const EVENT_COLUMNS: &str = "SELECT id, device_id, timestamp, event_type, \
     meta_data::text AS meta_data, published FROM events";

const ALERT_COLUMNS: &str = "SELECT id, source_event_id, event_type, description, \
     meta_data::text AS meta_data, created_at FROM alerts";

const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          BIGSERIAL PRIMARY KEY,
    device_id   TEXT        NOT NULL,
    timestamp   TIMESTAMPTZ NOT NULL,
    event_type  TEXT        NOT NULL,
    meta_data   JSON        NOT NULL DEFAULT '{}',
    published   BOOLEAN     NOT NULL DEFAULT FALSE
)"#;

const CREATE_EVENTS_OUTBOX_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS events_unpublished_idx ON events (id) WHERE NOT published";

const CREATE_ALERTS: &str = r#"
CREATE TABLE IF NOT EXISTS alerts (
    id               BIGSERIAL PRIMARY KEY,
    source_event_id  BIGINT UNIQUE,
    event_type       TEXT        NOT NULL,
    description      TEXT        NOT NULL,
    meta_data        JSON        NOT NULL DEFAULT '{}',
    created_at       TIMESTAMPTZ NOT NULL
)"#;

/// Event and alert tables on a shared connection pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Open a pool and verify the connection
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| PipelineError::Config(format!("Invalid database URL: {}", e)))?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Persistence(format!("Failed to create pool: {}", e)))?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        tracing::info!(max_connections, "Database pool created");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables when absent
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in [CREATE_EVENTS, CREATE_EVENTS_OUTBOX_INDEX, CREATE_ALERTS] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Schema ensured");
        Ok(())
    }
}

fn decode_metadata(row: &PgRow) -> Result<Metadata> {
    let raw: String = row.try_get("meta_data")?;
    Ok(serde_json::from_str(&raw)?)
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent> {
    Ok(StoredEvent {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        timestamp: row.try_get("timestamp")?,
        event_type: row.try_get("event_type")?,
        metadata: decode_metadata(row)?,
        published: row.try_get("published")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        source_event_id: row.try_get("source_event_id")?,
        event_type: row.try_get("event_type")?,
        description: row.try_get("description")?,
        metadata: decode_metadata(row)?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: &Event) -> Result<StoredEvent> {
        let metadata = serde_json::to_string(&event.metadata)?;
        let row = sqlx::query(
            "INSERT INTO events (device_id, timestamp, event_type, meta_data, published) \
             VALUES ($1, $2, $3, CAST($4 AS JSON), FALSE) RETURNING id",
        )
        .bind(&event.device_id)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        tracing::debug!(event_id = id, device_id = %event.device_id, "Event persisted");

        Ok(StoredEvent {
            id,
            device_id: event.device_id.clone(),
            timestamp: event.timestamp,
            event_type: event.event_type.clone(),
            metadata: event.metadata.clone(),
            published: false,
        })
    }

    async fn mark_published(&self, event_id: i64) -> Result<()> {
        sqlx::query("UPDATE events SET published = TRUE WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unpublished_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "{} WHERE NOT published ORDER BY id LIMIT $1",
            EVENT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_events(&self, query: &EventQuery) -> Result<Vec<StoredEvent>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(EVENT_COLUMNS);
        qb.push(" WHERE TRUE");
        if let Some(start) = query.start_time {
            qb.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = query.end_time {
            qb.push(" AND timestamp <= ").push_bind(end);
        }
        if let Some(event_type) = &query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(device_id) = &query.device_id {
            qb.push(" AND device_id = ").push_bind(device_id.clone());
        }
        if let Some(device_type) = &query.device_type {
            qb.push(" AND meta_data::jsonb ->> 'device_type' = ")
                .push_bind(device_type.clone());
        }
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl AlertStore for PostgresStore {
    async fn insert_alert(&self, alert: &NewAlert) -> Result<Option<Alert>> {
        let metadata = serde_json::to_string(&alert.metadata)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO alerts (source_event_id, event_type, description, meta_data, created_at) \
             VALUES ($1, $2, $3, CAST($4 AS JSON), $5) \
             ON CONFLICT (source_event_id) DO NOTHING RETURNING id",
        )
        .bind(alert.source_event_id)
        .bind(&alert.event_type)
        .bind(&alert.description)
        .bind(metadata)
        .bind(alert.created_at)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let Some(row) = row else {
            tracing::debug!(
                source_event_id = ?alert.source_event_id,
                "Alert already recorded for event"
            );
            return Ok(None);
        };

        Ok(Some(Alert {
            id: row.try_get("id")?,
            source_event_id: alert.source_event_id,
            event_type: alert.event_type.clone(),
            description: alert.description.clone(),
            metadata: alert.metadata.clone(),
            created_at: alert.created_at,
        }))
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(ALERT_COLUMNS);
        qb.push(" WHERE TRUE");
        if let Some(start) = query.start_time {
            qb.push(" AND created_at >= ").push_bind(start);
        }
        if let Some(end) = query.end_time {
            qb.push(" AND created_at <= ").push_bind(end);
        }
        if let Some(event_type) = &query.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        qb.push(" ORDER BY id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        match PostgresStore::connect("not-a-url", 1).await {
            Err(PipelineError::Config(msg)) => assert!(msg.contains("Invalid database URL")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected with an invalid URL"),
        }
    }

    #[test]
    fn test_schema_declares_alert_uniqueness() {
        assert!(CREATE_ALERTS.contains("source_event_id  BIGINT UNIQUE"));
        assert!(CREATE_EVENTS.contains("published   BOOLEAN"));
    }
}
