//! User-visible status stream.
//!
//! Pipeline tasks publish [`StatusEvent`]s on a broadcast channel; the CLI
//! renders them as timestamped lines. Nobody listening is not an error.

use crate::alert::DeliveryStatus;
use crate::core::inference::Decision;
use crate::core::types::OperatingMode;
use crate::link::LinkState;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const STATUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Link {
        state: LinkState,
        mode: Option<OperatingMode>,
    },
    Retrying {
        attempt: u64,
        delay: Duration,
        reason: String,
    },
    SessionStarted {
        session: u64,
        mode: OperatingMode,
    },
    SessionEnded {
        session: u64,
        reason: String,
    },
    Filling {
        len: usize,
        capacity: usize,
    },
    WindowReady {
        capacity: usize,
    },
    Prediction(Decision),
    AlertDispatched {
        probability: f32,
        delivery: DeliveryStatus,
        record_id: Option<String>,
    },
    AlertSuppressed {
        probability: f32,
        remaining: Duration,
    },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Link { state, mode: Some(mode) } => write!(f, "Link {state}: {mode}"),
            StatusEvent::Link { state, mode: None } => write!(f, "Link {state}"),
            StatusEvent::Retrying {
                attempt,
                delay,
                reason,
            } => write!(
                f,
                "{reason}; retrying in {}s (attempt {attempt})",
                delay.as_secs_f32()
            ),
            StatusEvent::SessionStarted { session, mode } => {
                write!(f, "Session {session} started in {mode} mode")
            }
            StatusEvent::SessionEnded { session, reason } => {
                write!(f, "Session {session} ended: {reason}")
            }
            StatusEvent::Filling { len, capacity } => {
                write!(f, "Filling window: {len}/{capacity} samples")
            }
            StatusEvent::WindowReady { capacity } => {
                write!(f, "Window ready ({capacity} samples), predicting")
            }
            StatusEvent::Prediction(decision) => write!(f, "Prediction: {decision}"),
            StatusEvent::AlertDispatched {
                probability,
                delivery,
                record_id,
            } => {
                write!(
                    f,
                    "ALERT dispatched ({:.1}%), delivery {delivery}",
                    probability * 100.0
                )?;
                if let Some(id) = record_id {
                    write!(f, ", record {id}")?;
                }
                Ok(())
            }
            StatusEvent::AlertSuppressed {
                probability,
                remaining,
            } => write!(
                f,
                "Fall candidate ({:.1}%) suppressed, cooldown {:.1}s left",
                probability * 100.0,
                remaining.as_secs_f32()
            ),
        }
    }
}

/// Sending half of the status stream.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: Option<broadcast::Sender<StatusEvent>>,
}

impl StatusSender {
    /// A sender plus its first receiver.
    pub fn channel() -> (Self, broadcast::Receiver<StatusEvent>) {
        let (tx, rx) = broadcast::channel(STATUS_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<StatusEvent>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }
}
