//! Rate-limited alert dispatch.
//!
//! A fall usually produces several consecutive positive windows. The
//! coordinator turns that burst into one alert: after an alert is attempted,
//! further candidates are suppressed until the cooldown has elapsed. The
//! cooldown is armed as soon as persistence has been attempted, whatever its
//! result, so a failing backend cannot cause an alert storm.

use crate::alert::event::{AlertEvent, AlertOutcome, DeliveryStatus};
use crate::alert::message::format_alert_message;
use crate::alert::{AlertStore, Notifier};
use crate::core::types::{ChannelSnapshots, OperatingMode};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Time source for cooldown decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    /// Messaging recipient (phone number for the WhatsApp relay)
    pub recipient: String,
    /// Monitored person, used in the message and the record
    pub person: String,
    pub timezone: Tz,
    /// Classification label stored with each record
    pub label: String,
    /// Events kept in memory for export
    pub history_limit: usize,
    /// Identifies this host in stored records
    pub device: String,
}

/// Device identifier derived from the hostname.
pub fn device_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("fallwatch-{hostname}")
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(10),
            recipient: String::new(),
            person: "monitored person".to_string(),
            timezone: Tz::UTC,
            label: "fall detected".to_string(),
            history_limit: 100,
            device: device_id(),
        }
    }
}

/// Context that travels with a candidate but does not affect gating.
#[derive(Debug, Clone, Copy)]
pub struct AlertDetails {
    pub mode: OperatingMode,
    pub peak_accel_magnitude: Option<f64>,
}

impl Default for AlertDetails {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Dual,
            peak_accel_magnitude: None,
        }
    }
}

/// Cooldown state plus the two collaborators. Lives for the whole run,
/// across reconnects.
pub struct AlertCoordinator {
    settings: AlertSettings,
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    last_alert: Option<DateTime<Utc>>,
    history: VecDeque<AlertEvent>,
}

impl AlertCoordinator {
    pub fn new(
        settings: AlertSettings,
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_clock(settings, store, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: AlertSettings,
        store: Arc<dyn AlertStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            notifier,
            clock,
            last_alert: None,
            history: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &AlertSettings {
        &self.settings
    }

    pub fn last_alert(&self) -> Option<DateTime<Utc>> {
        self.last_alert
    }

    /// Dispatched events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &AlertEvent> {
        self.history.iter()
    }

    /// Time left in the cooldown, if it is active at `now`.
    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_alert?;
        let elapsed = now - last;
        (elapsed < self.settings.cooldown).then(|| self.settings.cooldown - elapsed)
    }

    pub async fn maybe_alert(&mut self, probability: f32, snapshots: ChannelSnapshots) -> AlertOutcome {
        self.maybe_alert_with(probability, snapshots, AlertDetails::default())
            .await
    }

    /// Gate a fall candidate through the cooldown and dispatch it.
    pub async fn maybe_alert_with(
        &mut self,
        probability: f32,
        snapshots: ChannelSnapshots,
        details: AlertDetails,
    ) -> AlertOutcome {
        let now = self.clock.now();
        if let Some(remaining) = self.cooldown_remaining(now) {
            tracing::debug!(
                probability,
                remaining_ms = remaining.num_milliseconds(),
                "alert suppressed by cooldown"
            );
            return AlertOutcome::Suppressed { remaining };
        }

        let mut event = AlertEvent::new(now, probability, snapshots, details.mode);
        event.peak_accel_magnitude = details.peak_accel_magnitude;

        let record = event.record(
            &self.settings.label,
            &self.settings.person,
            &self.settings.device,
        );
        match self.store.record(&record).await {
            Ok(id) => {
                event.record_id = Some(id);
                event.persistence = DeliveryStatus::Sent;
            }
            Err(e) => {
                tracing::error!(store = self.store.name(), error = %e, "failed to persist alert");
                event.persistence = DeliveryStatus::Failed {
                    error: e.to_string(),
                };
            }
        }
        self.last_alert = Some(now);

        let text = format_alert_message(&event, &self.settings.person, self.settings.timezone);
        match self.notifier.notify(&self.settings.recipient, &text).await {
            Ok(()) => event.messaging = DeliveryStatus::Sent,
            Err(e) => {
                tracing::error!(notifier = self.notifier.name(), error = %e, "failed to send alert message");
                event.messaging = DeliveryStatus::Failed {
                    error: e.to_string(),
                };
            }
        }

        tracing::info!(
            id = %event.id,
            probability,
            delivery = %event.delivery(),
            "fall alert dispatched"
        );

        self.push_history(event.clone());
        AlertOutcome::Dispatched(event)
    }

    fn push_history(&mut self, event: AlertEvent) {
        if self.settings.history_limit == 0 {
            return;
        }
        if self.history.len() == self.settings.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    /// Write the in-memory history to `<dir>/alerts_<timestamp>.json`.
    ///
    /// Returns `None` when there is nothing to export.
    pub fn export_history(&self, dir: &Path) -> Result<Option<PathBuf>, std::io::Error> {
        if self.history.is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(dir)?;

        let filename = format!("alerts_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(filename);
        let events: Vec<&AlertEvent> = self.history.iter().collect();
        let json = serde_json::to_string_pretty(&events).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(Some(path))
    }
}
