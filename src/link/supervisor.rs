//! Discover / subscribe / reconnect loop.
//!
//! ```text
//!   Disconnected ──▶ Discovering ──┬─ both found ──▶ Connected (dual)
//!        ▲                         ├─ one found ───▶ Degraded (single)
//!        │                         └─ none ────────▶ Disconnected, wait, retry
//!        └──────── transport failure ◀── session ◀──┘
//! ```
//!
//! Retries are unbounded with a fixed delay: the sensors may simply not be
//! powered on yet. Only cancellation ends the loop.

use crate::core::types::{Channel, OperatingMode};
use crate::link::{LinkConfig, LinkEvent, Subscription, SubscriptionHandle, Transport};
use crate::stats::{Counter, SharedStats};
use crate::status::{StatusEvent, StatusSender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Link supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Discovering,
    /// Both channels live
    Connected,
    /// Only one channel live; running on duplicated input
    Degraded,
}

impl LinkState {
    pub fn for_mode(mode: OperatingMode) -> Self {
        if mode.is_degraded() {
            LinkState::Degraded
        } else {
            LinkState::Connected
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Discovering => "discovering",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Operating mode for the set of channels discovery found.
pub fn select_mode(found: &[Channel]) -> Option<OperatingMode> {
    let hip = found.contains(&Channel::Hip);
    let leg = found.contains(&Channel::Leg);
    match (hip, leg) {
        (true, true) => Some(OperatingMode::Dual),
        (true, false) => Some(OperatingMode::SingleHip),
        (false, true) => Some(OperatingMode::SingleLeg),
        (false, false) => None,
    }
}

/// Identity of one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// 1-based session counter for this run
    pub number: u64,
    pub mode: OperatingMode,
}

/// The event queue of one subscribed channel.
#[derive(Debug)]
pub struct ChannelStream {
    pub channel: Channel,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transport failure; the supervisor will reconnect.
    Disconnected(String),
    /// Shutdown requested.
    Cancelled,
}

/// Runs the pipeline for one connection session.
#[async_trait]
pub trait SessionHandler: Send {
    /// Consume the streams until one of them disconnects or `cancel` fires.
    async fn run_session(
        &mut self,
        info: SessionInfo,
        streams: Vec<ChannelStream>,
        cancel: CancellationToken,
    ) -> SessionEnd;
}

pub struct LinkSupervisor {
    transport: Arc<dyn Transport>,
    config: LinkConfig,
    state: watch::Sender<LinkState>,
    status: StatusSender,
    stats: Option<SharedStats>,
}

impl LinkSupervisor {
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            transport,
            config,
            state,
            status: StatusSender::disabled(),
            stats: None,
        }
    }

    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = status;
        self
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Watch the link state.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LinkState, mode: Option<OperatingMode>) {
        self.state.send_replace(state);
        self.status.emit(StatusEvent::Link { state, mode });
    }

    fn count(&self, counter: Counter) {
        if let Some(stats) = &self.stats {
            stats.record(counter);
        }
    }

    /// Supervise the link until `cancel` fires.
    pub async fn run<H: SessionHandler>(&self, handler: &mut H, cancel: CancellationToken) {
        let mut sessions = 0u64;
        let mut attempt = 0u64;

        while !cancel.is_cancelled() {
            self.set_state(LinkState::Discovering, None);
            let discovery = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.transport.discover(&Channel::ALL, self.config.discovery_timeout) => result,
            };

            let found = match discovery {
                Ok(found) => found,
                Err(e) => {
                    attempt += 1;
                    if !self.back_off(attempt, e.to_string(), &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(mode) = select_mode(&found) else {
                attempt += 1;
                if !self
                    .back_off(attempt, "no sensors found".to_string(), &cancel)
                    .await
                {
                    break;
                }
                continue;
            };

            let subscriptions = match self.subscribe_all(mode).await {
                Ok(subscriptions) => subscriptions,
                Err(reason) => {
                    attempt += 1;
                    if !self.back_off(attempt, reason, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            attempt = 0;
            sessions += 1;
            self.count(Counter::Sessions);
            let info = SessionInfo {
                number: sessions,
                mode,
            };
            tracing::info!(session = sessions, %mode, "sensor session started");
            self.set_state(LinkState::for_mode(mode), Some(mode));
            self.status.emit(StatusEvent::SessionStarted {
                session: sessions,
                mode,
            });

            let handles: Vec<SubscriptionHandle> = subscriptions.iter().map(|s| s.handle).collect();
            let streams = subscriptions
                .into_iter()
                .map(|s| ChannelStream {
                    channel: s.handle.channel,
                    events: s.events,
                })
                .collect();

            let session_cancel = cancel.child_token();
            let end = handler
                .run_session(info, streams, session_cancel.clone())
                .await;
            session_cancel.cancel();
            self.unsubscribe_all(&handles).await;
            self.set_state(LinkState::Disconnected, None);

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Disconnected(reason) => {
                    tracing::warn!(session = sessions, %reason, "sensor session lost");
                    self.status.emit(StatusEvent::SessionEnded {
                        session: sessions,
                        reason: reason.clone(),
                    });
                    attempt += 1;
                    if !self.back_off(attempt, reason, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected, None);
        tracing::info!("link supervisor stopped");
    }

    /// Subscribe every channel of `mode`; on failure undo what succeeded.
    async fn subscribe_all(&self, mode: OperatingMode) -> Result<Vec<Subscription>, String> {
        let mut subscriptions = Vec::with_capacity(mode.channels().len());
        for &channel in mode.channels() {
            match self.transport.subscribe(channel).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    let handles: Vec<SubscriptionHandle> =
                        subscriptions.iter().map(|s| s.handle).collect();
                    self.unsubscribe_all(&handles).await;
                    return Err(e.to_string());
                }
            }
        }
        Ok(subscriptions)
    }

    async fn unsubscribe_all(&self, handles: &[SubscriptionHandle]) {
        for handle in handles {
            if let Err(e) = self.transport.unsubscribe(*handle).await {
                tracing::debug!(channel = %handle.channel, error = %e, "unsubscribe failed");
            }
        }
    }

    /// Wait the retry delay. Returns `false` if cancelled meanwhile.
    async fn back_off(&self, attempt: u64, reason: String, cancel: &CancellationToken) -> bool {
        let delay = self.config.retry_delay;
        tracing::warn!(attempt, %reason, delay_ms = delay.as_millis() as u64, "reconnecting");
        self.count(Counter::ReconnectAttempts);
        self.set_state(LinkState::Disconnected, None);
        self.status.emit(StatusEvent::Retrying {
            attempt,
            delay,
            reason,
        });

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_mode() {
        assert_eq!(select_mode(&[Channel::Hip, Channel::Leg]), Some(OperatingMode::Dual));
        assert_eq!(select_mode(&[Channel::Leg]), Some(OperatingMode::SingleLeg));
        assert_eq!(select_mode(&[Channel::Hip]), Some(OperatingMode::SingleHip));
        assert_eq!(select_mode(&[]), None);
    }

    #[test]
    fn test_state_for_mode() {
        assert_eq!(LinkState::for_mode(OperatingMode::Dual), LinkState::Connected);
        assert_eq!(LinkState::for_mode(OperatingMode::SingleHip), LinkState::Degraded);
    }
}
