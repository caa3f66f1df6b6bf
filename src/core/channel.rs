//! Per-channel latest-reading cells.
//!
//! Each channel has exactly one writer (its ingest task) and any number of
//! readers. Only the newest reading matters for fusion, so the cell holds a
//! single value that is replaced wholesale; readers may see a reading that
//! is one packet stale, never a torn one.

use crate::core::types::{Channel, ChannelSnapshots, SixAxisReading, TimedReading};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Latest-value cache for one sensor channel.
#[derive(Debug)]
pub struct ChannelState {
    channel: Channel,
    latest: RwLock<Option<TimedReading>>,
    live: AtomicBool,
    updates: AtomicU64,
}

impl ChannelState {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            latest: RwLock::new(None),
            live: AtomicBool::new(false),
            updates: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Replace the cached reading. Never fails.
    pub fn update(&self, reading: SixAxisReading) {
        let timed = TimedReading {
            reading,
            received_at: Utc::now(),
        };
        // A poisoned lock still holds a valid Option; keep going.
        let mut slot = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(timed);
        drop(slot);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// The most recent reading, or the zero reading if none arrived yet.
    pub fn snapshot(&self) -> SixAxisReading {
        self.latest()
            .map(|timed| timed.reading)
            .unwrap_or(SixAxisReading::ZERO)
    }

    /// The most recent reading with its arrival time, if any.
    pub fn latest(&self) -> Option<TimedReading> {
        *self.latest.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_reading(&self) -> bool {
        self.latest().is_some()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|timed| timed.received_at)
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// The hip and leg cells of one connection session.
#[derive(Debug)]
pub struct ChannelSet {
    hip: ChannelState,
    leg: ChannelState,
}

/// Thread-safe shared channel set.
pub type SharedChannels = Arc<ChannelSet>;

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            hip: ChannelState::new(Channel::Hip),
            leg: ChannelState::new(Channel::Leg),
        }
    }

    pub fn get(&self, channel: Channel) -> &ChannelState {
        match channel {
            Channel::Hip => &self.hip,
            Channel::Leg => &self.leg,
        }
    }

    /// Channels currently flagged live.
    pub fn live_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.get(*c).is_live())
            .collect()
    }

    /// Raw latest readings, for attaching to alerts.
    pub fn snapshots(&self) -> ChannelSnapshots {
        ChannelSnapshots {
            hip: self.hip.latest().map(|t| t.reading),
            leg: self.leg.latest().map(|t| t.reading),
        }
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}
