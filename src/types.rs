//! Core data types for the alerting pipeline
//!
//! Wire and record shapes use snake_case JSON. Persisted records expose their
//! metadata under `meta_data` for the query collaborators.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Ordered key → value map carried by events, envelopes, and alerts
pub type Metadata = serde_json::Map<String, serde_json::Value>;

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").unwrap())
}

/// A validated device identifier (six hex octets separated by colons)
///
/// The original spelling is preserved; `aa:bb:...` and `AA:BB:...` are
/// distinct directory keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate and wrap a device identifier
    pub fn parse(raw: &str) -> Result<Self> {
        if mac_regex().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(PipelineError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An incoming telemetry event, before validation and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Device MAC address (validated by the ingestor)
    pub device_id: String,

    /// When the device observed the event
    pub timestamp: DateTime<Utc>,

    /// Event type identifier (e.g., "speed_violation")
    pub event_type: String,

    /// Type-specific readings
    #[serde(default, alias = "meta_data")]
    pub metadata: Metadata,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(device_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            metadata: Metadata::new(),
        }
    }

    /// Override the observation time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A persisted event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(rename = "meta_data")]
    pub metadata: Metadata,

    /// Whether the envelope for this event has reached the channel
    #[serde(skip)]
    pub published: bool,
}

impl StoredEvent {
    /// Project the stored event into its channel envelope
    pub fn envelope(&self) -> Envelope {
        Envelope {
            event_id: Some(self.id),
            device_id: self.device_id.clone(),
            event_type: self.event_type.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Wire form published to the durable channel
///
/// `event_id` is optional on decode so that envelopes without an identity
/// still evaluate; such envelopes cannot be de-duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    pub device_id: String,
    pub event_type: String,
    #[serde(default, alias = "meta_data")]
    pub metadata: Metadata,
}

impl Envelope {
    /// Channel-level deduplication key derived from the event identity
    pub fn dedup_key(&self) -> Option<String> {
        self.event_id.map(|id| format!("event-{}", id))
    }
}

/// Device classification stored in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClassification {
    pub device_type: String,
}

impl DeviceClassification {
    pub fn new(device_type: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
        }
    }

    /// Derive a classification from the first event type seen for a device
    pub fn for_event_type(event_type: &str) -> Self {
        let device_type = match event_type {
            "access_attempt" => "access_controller",
            "motion_detected" => "motion_sensor",
            "temperature_reading" => "temperature_sensor",
            "humidity_reading" => "humidity_sensor",
            "pressure_change" => "pressure_sensor",
            "proximity_alert" => "proximity_sensor",
            "light_level_change" => "light_sensor",
            "gas_leak_detected" => "gas_sensor",
            "smoke_detected" => "smoke_sensor",
            "water_quality_alert" => "water_quality_sensor",
            "chemical_spill_detected" => "chemical_sensor",
            "infrared_motion_detected" => "infrared_sensor",
            "acceleration_event" => "accelerometer",
            "gyroscope_data" => "gyroscope",
            "magnetic_field_change" => "magnetic_field_sensor",
            "sound_detected" => "sound_sensor",
            "liquid_level_change" => "level_sensor",
            "radiation_alert" => "radiation_sensor",
            "image_captured" => "image_sensor",
            "touch_event" => "touch_sensor",
            "ultrasonic_distance_measured" => "ultrasonic_sensor",
            _ => "unknown_sensor",
        };
        Self::new(device_type)
    }
}

/// An alert ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    /// Event that triggered the alert (uniqueness key when present)
    pub source_event_id: Option<i64>,
    pub event_type: String,
    pub description: String,
    pub metadata: Metadata,
    /// Evaluation time, not event time
    pub created_at: DateTime<Utc>,
}

/// A persisted alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "alert_id")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<i64>,
    pub event_type: String,
    pub description: String,
    #[serde(rename = "meta_data")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// Filters for event queries; all bounds are inclusive
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Matches the `device_type` key reported in event metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

impl EventQuery {
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.start_time.map_or(true, |t| event.timestamp >= t)
            && self.end_time.map_or(true, |t| event.timestamp <= t)
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| event.event_type == t)
            && self
                .device_id
                .as_deref()
                .map_or(true, |d| event.device_id == d)
            && self.device_type.as_deref().map_or(true, |t| {
                event.metadata.get("device_type").and_then(|v| v.as_str()) == Some(t)
            })
    }
}

/// Filters for alert queries; the time range applies to `created_at`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.start_time.map_or(true, |t| alert.created_at >= t)
            && self.end_time.map_or(true, |t| alert.created_at <= t)
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| alert.event_type == t)
    }
}

/// A received envelope with delivery context
#[derive(Debug, Clone)]
pub struct ReceivedEnvelope {
    /// The envelope data
    pub envelope: Envelope,

    /// Provider-assigned sequence number
    pub sequence: u64,

    /// Number of delivery attempts, including this one
    pub num_delivered: u64,

    /// Stream/queue name
    pub stream: String,
}

/// A delivered payload that could not be decoded as an `Envelope`
#[derive(Debug, Clone, PartialEq)]
pub struct UndecodablePayload {
    /// Raw message body as received
    pub payload: Vec<u8>,

    /// Decoder error message
    pub error: String,

    pub sequence: u64,
    pub num_delivered: u64,
    pub stream: String,
}

/// Options for publishing envelopes
///
/// Unsupported options are ignored by providers that don't support them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Deduplication message ID (NATS: `Nats-Msg-Id` header)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,

    /// Publish ack timeout in seconds (overrides provider default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PublishOptions {
    /// Options carrying the envelope's dedup key, if it has one
    pub fn for_envelope(envelope: &Envelope) -> Self {
        Self {
            msg_id: envelope.dedup_key(),
            timeout_secs: None,
        }
    }
}

/// Options for creating durable subscriptions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Maximum delivery attempts the broker will make (NATS: `MaxDeliver`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,

    /// Maximum number of unacknowledged messages in flight (NATS: `MaxAckPending`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,

    /// How long to wait for an ack before redelivery (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_secs: Option<u64>,
}
