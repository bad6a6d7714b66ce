//! Per-event-type alert rules
//!
//! | event_type        | fires when                              |
//! |-------------------|-----------------------------------------|
//! | `access_attempt`  | `user_id` is not in the authorized set  |
//! | `speed_violation` | `speed_kmh > 100`                       |
//! | `motion_detected` | `confidence > 0.9`                      |
//!
//! Every other event type never fires. Rules are stateless; the only
//! outside read is the authorization check.

use crate::directory::DeviceDirectory;
use crate::error::{PipelineError, Result};
use crate::types::{Envelope, Metadata};
use serde_json::{Number, Value};

/// Speed above which a `speed_violation` raises an alert, in km/h
pub const SPEED_LIMIT_KMH: f64 = 100.0;

/// Confidence above which a `motion_detected` raises an alert
pub const MOTION_CONFIDENCE_THRESHOLD: f64 = 0.9;

/// A rule hit, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub event_type: String,
    pub description: String,
    pub metadata: Metadata,
}

impl AlertDraft {
    fn from_envelope(envelope: &Envelope, description: String) -> Self {
        Self {
            event_type: envelope.event_type.clone(),
            description,
            metadata: envelope.metadata.clone(),
        }
    }
}

/// Evaluate the rule table against one envelope
pub async fn evaluate(
    envelope: &Envelope,
    directory: &dyn DeviceDirectory,
) -> Result<Option<AlertDraft>> {
    let description = match envelope.event_type.as_str() {
        "access_attempt" => check_access(envelope, directory).await?,
        "speed_violation" => {
            let speed = reading(envelope, "speed_kmh")?;
            (as_f64(&speed) > SPEED_LIMIT_KMH)
                .then(|| format!("Speed violation detected: {} km/h", speed))
        }
        "motion_detected" => {
            let confidence = reading(envelope, "confidence")?;
            (as_f64(&confidence) > MOTION_CONFIDENCE_THRESHOLD)
                .then(|| format!("Motion detected with high confidence: {}", confidence))
        }
        _ => None,
    };

    Ok(description.map(|d| AlertDraft::from_envelope(envelope, d)))
}

async fn check_access(
    envelope: &Envelope,
    directory: &dyn DeviceDirectory,
) -> Result<Option<String>> {
    let authorized = match envelope.metadata.get("user_id").and_then(Value::as_str) {
        Some(user_id) => directory.is_authorized(user_id).await?,
        None => false,
    };

    Ok((!authorized).then(|| "user is not authorized to access".to_string()))
}

/// Numeric reading, zero when absent or null
fn reading(envelope: &Envelope, key: &str) -> Result<Number> {
    match envelope.metadata.get(key) {
        None | Some(Value::Null) => Ok(Number::from(0)),
        Some(Value::Number(n)) => Ok(n.clone()),
        Some(other) => Err(PipelineError::Evaluation {
            event_type: envelope.event_type.clone(),
            reason: format!("'{}' is not a number: {}", key, other),
        }),
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use serde_json::json;

    fn envelope(event_type: &str, metadata: Value) -> Envelope {
        Envelope {
            event_id: Some(1),
            device_id: "11:22:33:44:55:66".to_string(),
            event_type: event_type.to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    async fn eval(event_type: &str, metadata: Value) -> Result<Option<AlertDraft>> {
        evaluate(&envelope(event_type, metadata), &MemoryDirectory::new()).await
    }

    #[tokio::test]
    async fn test_speed_above_limit_alerts() {
        let draft = eval("speed_violation", json!({"speed_kmh": 120, "location": "gate-1"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(draft.description, "Speed violation detected: 120 km/h");
        assert_eq!(draft.event_type, "speed_violation");
        assert_eq!(draft.metadata["location"], "gate-1");

        let draft = eval("speed_violation", json!({"speed_kmh": 100.5}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(draft.description, "Speed violation detected: 100.5 km/h");
    }

    #[tokio::test]
    async fn test_speed_at_or_below_limit_is_quiet() {
        for speed in [json!(100), json!(100.0), json!(0), json!(-5)] {
            assert!(eval("speed_violation", json!({ "speed_kmh": speed }))
                .await
                .unwrap()
                .is_none());
        }
        assert!(eval("speed_violation", json!({})).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_motion_boundary_is_strict() {
        assert!(eval("motion_detected", json!({"confidence": 0.9}))
            .await
            .unwrap()
            .is_none());

        let draft = eval("motion_detected", json!({"confidence": 0.95}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(draft.description, "Motion detected with high confidence: 0.95");
    }

    #[tokio::test]
    async fn test_non_numeric_reading_is_evaluation_error() {
        let err = eval("speed_violation", json!({"speed_kmh": "fast"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Evaluation { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_access_attempt_checks_authorized_set() {
        let dir = MemoryDirectory::new();
        dir.authorize("alice").await.unwrap();

        let allowed = envelope("access_attempt", json!({"user_id": "alice"}));
        assert!(evaluate(&allowed, &dir).await.unwrap().is_none());

        let denied = envelope("access_attempt", json!({"user_id": "mallory"}));
        let draft = evaluate(&denied, &dir).await.unwrap().unwrap();
        assert_eq!(draft.description, "user is not authorized to access");

        let anonymous = envelope("access_attempt", json!({}));
        assert!(evaluate(&anonymous, &dir).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_other_event_types_never_fire() {
        assert!(eval("temperature_reading", json!({"speed_kmh": 500, "confidence": 1.0}))
            .await
            .unwrap()
            .is_none());
    }
}
