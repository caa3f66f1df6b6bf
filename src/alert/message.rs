//! Human-readable alert text.

use crate::alert::event::AlertEvent;
use chrono_tz::Tz;

/// Build the notification text for an event.
///
/// The timestamp is rendered in the caregiver's timezone, not UTC.
pub fn format_alert_message(event: &AlertEvent, person: &str, timezone: Tz) -> String {
    let local = event.timestamp.with_timezone(&timezone);
    let mut text = format!(
        "FALL ALERT\n\
         Person: {person}\n\
         Time: {} ({timezone})\n\
         Confidence: {:.1}%\n\
         Sensors: {}",
        local.format("%d/%m/%Y, %H:%M:%S"),
        event.probability * 100.0,
        event.mode,
    );
    if let Some(id) = &event.record_id {
        text.push_str(&format!("\nRecord: {id}"));
    }
    text
}

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        tracing::warn!(timezone = name, "unknown timezone, using UTC");
        Tz::UTC
    })
}
