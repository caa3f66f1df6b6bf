//! Alert records and outcomes.

use crate::core::types::{ChannelSnapshots, OperatingMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Delivery state of one collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed { error: String },
}

impl DeliveryStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeliveryStatus::Failed { .. })
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// What the persistence collaborator receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub probability: f32,
    pub snapshots: ChannelSnapshots,
    /// Free-text classification label
    pub label: String,
    pub mode: OperatingMode,
    /// Monitored person
    pub person: String,
    /// Host running the detector
    pub device: String,
}

/// One detection instance.
///
/// Built by the coordinator, finalised once both collaborator calls have
/// returned, and never changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub probability: f32,
    pub snapshots: ChannelSnapshots,
    pub mode: OperatingMode,
    /// Largest accelerometer norm in the window that triggered the alert
    pub peak_accel_magnitude: Option<f64>,
    /// Identifier returned by the alert store
    pub record_id: Option<String>,
    pub persistence: DeliveryStatus,
    pub messaging: DeliveryStatus,
}

impl AlertEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        probability: f32,
        snapshots: ChannelSnapshots,
        mode: OperatingMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            probability,
            snapshots,
            mode,
            peak_accel_magnitude: None,
            record_id: None,
            persistence: DeliveryStatus::Pending,
            messaging: DeliveryStatus::Pending,
        }
    }

    pub fn record(&self, label: &str, person: &str, device: &str) -> AlertRecord {
        AlertRecord {
            timestamp: self.timestamp,
            probability: self.probability,
            snapshots: self.snapshots,
            label: label.to_string(),
            mode: self.mode,
            person: person.to_string(),
            device: device.to_string(),
        }
    }

    /// Combined delivery outcome: failed if either call failed, sent if both
    /// succeeded, pending otherwise.
    pub fn delivery(&self) -> DeliveryStatus {
        match (&self.persistence, &self.messaging) {
            (DeliveryStatus::Failed { error }, _) | (_, DeliveryStatus::Failed { error }) => {
                DeliveryStatus::Failed {
                    error: error.clone(),
                }
            }
            (DeliveryStatus::Sent, DeliveryStatus::Sent) => DeliveryStatus::Sent,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// Result of one `maybe_alert` call.
#[derive(Debug, Clone)]
pub enum AlertOutcome {
    /// Inside the cooldown; nothing was sent.
    Suppressed { remaining: chrono::Duration },
    Dispatched(AlertEvent),
}

impl AlertOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, AlertOutcome::Dispatched(_))
    }

    pub fn event(&self) -> Option<&AlertEvent> {
        match self {
            AlertOutcome::Dispatched(event) => Some(event),
            AlertOutcome::Suppressed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> AlertEvent {
        AlertEvent::new(
            Utc::now(),
            0.97,
            ChannelSnapshots::default(),
            OperatingMode::Dual,
        )
    }

    #[test]
    fn test_new_event_is_pending() {
        let event = event();
        assert_eq!(event.delivery(), DeliveryStatus::Pending);
        assert!(event.record_id.is_none());
    }

    #[test]
    fn test_delivery_combines_statuses() {
        let mut event = event();
        event.persistence = DeliveryStatus::Sent;
        event.messaging = DeliveryStatus::Sent;
        assert_eq!(event.delivery(), DeliveryStatus::Sent);

        event.messaging = DeliveryStatus::Failed {
            error: "relay down".to_string(),
        };
        assert!(event.delivery().is_failed());
    }

    #[test]
    fn test_event_serializes_status_tag() {
        let mut event = event();
        event.persistence = DeliveryStatus::Failed {
            error: "timeout".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["persistence"]["status"], "failed");
        assert_eq!(json["messaging"]["status"], "pending");
    }
}
