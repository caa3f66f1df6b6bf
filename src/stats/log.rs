//! Cumulative pipeline counters.

use crate::core::types::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something the pipeline counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    HipPackets,
    LegPackets,
    MalformedPackets,
    Ticks,
    SamplesPushed,
    ZeroSamplesSuppressed,
    Inferences,
    InferenceFailures,
    FallCandidates,
    AlertsDispatched,
    AlertsSuppressed,
    AlertsFailed,
    Sessions,
    ReconnectAttempts,
}

impl Counter {
    pub const ALL: [Counter; 14] = [
        Counter::HipPackets,
        Counter::LegPackets,
        Counter::MalformedPackets,
        Counter::Ticks,
        Counter::SamplesPushed,
        Counter::ZeroSamplesSuppressed,
        Counter::Inferences,
        Counter::InferenceFailures,
        Counter::FallCandidates,
        Counter::AlertsDispatched,
        Counter::AlertsSuppressed,
        Counter::AlertsFailed,
        Counter::Sessions,
        Counter::ReconnectAttempts,
    ];

    /// Valid-packet counter for a channel.
    pub fn packets(channel: Channel) -> Counter {
        match channel {
            Channel::Hip => Counter::HipPackets,
            Channel::Leg => Counter::LegPackets,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Thread-safe counter set, shared by every task of a run.
#[derive(Debug)]
pub struct StatsLog {
    counters: [AtomicU64; Counter::ALL.len()],
    /// Start of the current process
    run_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl StatsLog {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that continues from (and saves to) `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous run statistics");
        }

        log
    }

    pub fn record(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            hip_packets: self.get(Counter::HipPackets),
            leg_packets: self.get(Counter::LegPackets),
            malformed_packets: self.get(Counter::MalformedPackets),
            ticks: self.get(Counter::Ticks),
            samples_pushed: self.get(Counter::SamplesPushed),
            zero_samples_suppressed: self.get(Counter::ZeroSamplesSuppressed),
            inferences: self.get(Counter::Inferences),
            inference_failures: self.get(Counter::InferenceFailures),
            fall_candidates: self.get(Counter::FallCandidates),
            alerts_dispatched: self.get(Counter::AlertsDispatched),
            alerts_suppressed: self.get(Counter::AlertsSuppressed),
            alerts_failed: self.get(Counter::AlertsFailed),
            sessions: self.get(Counter::Sessions),
            reconnect_attempts: self.get(Counter::ReconnectAttempts),
            run_start: self.run_start,
            last_updated: Utc::now(),
        }
    }

    /// Multi-line summary for the CLI.
    pub fn summary(&self) -> String {
        let s = self.stats();
        format!(
            "Run Statistics:\n\
             - Packets received: {} hip, {} leg\n\
             - Malformed packets dropped: {}\n\
             - Ticks: {} ({} samples pushed, {} zero samples suppressed)\n\
             - Model calls: {} ({} failed)\n\
             - Fall candidates: {}\n\
             - Alerts: {} dispatched, {} suppressed by cooldown, {} with delivery failures\n\
             - Sessions: {} ({} reconnect attempts)",
            s.hip_packets,
            s.leg_packets,
            s.malformed_packets,
            s.ticks,
            s.samples_pushed,
            s.zero_samples_suppressed,
            s.inferences,
            s.inference_failures,
            s.fall_candidates,
            s.alerts_dispatched,
            s.alerts_suppressed,
            s.alerts_failed,
            s.sessions,
            s.reconnect_attempts,
        )
    }

    /// Save counters to disk (no-op without a persistence path).
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&self.stats()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: RunStats = serde_json::from_str(&content).map_err(std::io::Error::other)?;
        for counter in Counter::ALL {
            self.counters[counter.index()].store(persisted.value(counter), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for StatsLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters. Also the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub hip_packets: u64,
    pub leg_packets: u64,
    pub malformed_packets: u64,
    pub ticks: u64,
    pub samples_pushed: u64,
    pub zero_samples_suppressed: u64,
    pub inferences: u64,
    pub inference_failures: u64,
    pub fall_candidates: u64,
    pub alerts_dispatched: u64,
    pub alerts_suppressed: u64,
    pub alerts_failed: u64,
    pub sessions: u64,
    pub reconnect_attempts: u64,
    pub run_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl RunStats {
    pub fn value(&self, counter: Counter) -> u64 {
        match counter {
            Counter::HipPackets => self.hip_packets,
            Counter::LegPackets => self.leg_packets,
            Counter::MalformedPackets => self.malformed_packets,
            Counter::Ticks => self.ticks,
            Counter::SamplesPushed => self.samples_pushed,
            Counter::ZeroSamplesSuppressed => self.zero_samples_suppressed,
            Counter::Inferences => self.inferences,
            Counter::InferenceFailures => self.inference_failures,
            Counter::FallCandidates => self.fall_candidates,
            Counter::AlertsDispatched => self.alerts_dispatched,
            Counter::AlertsSuppressed => self.alerts_suppressed,
            Counter::AlertsFailed => self.alerts_failed,
            Counter::Sessions => self.sessions,
            Counter::ReconnectAttempts => self.reconnect_attempts,
        }
    }
}

/// Thread-safe shared stats log.
pub type SharedStats = Arc<StatsLog>;

/// Create a shared log, persisted at `path` if given.
pub fn create_shared_stats(path: Option<PathBuf>) -> SharedStats {
    match path {
        Some(path) => Arc::new(StatsLog::with_persistence(path)),
        None => Arc::new(StatsLog::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let log = StatsLog::new();
        log.record(Counter::MalformedPackets);
        log.record(Counter::MalformedPackets);
        log.record(Counter::packets(Channel::Leg));

        let stats = log.stats();
        assert_eq!(stats.malformed_packets, 2);
        assert_eq!(stats.leg_packets, 1);
        assert_eq!(stats.hip_packets, 0);
    }

    #[test]
    fn test_reset() {
        let log = StatsLog::new();
        log.add(Counter::Ticks, 100);
        log.reset();
        assert_eq!(log.get(Counter::Ticks), 0);
    }

    #[test]
    fn test_counter_indices_are_distinct() {
        let log = StatsLog::new();
        for (i, counter) in Counter::ALL.iter().enumerate() {
            log.add(*counter, i as u64 + 1);
        }
        let stats = log.stats();
        for (i, counter) in Counter::ALL.iter().enumerate() {
            assert_eq!(stats.value(*counter), i as u64 + 1);
        }
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let log = StatsLog::with_persistence(path.clone());
        log.add(Counter::AlertsDispatched, 3);
        log.record(Counter::Sessions);
        log.save().unwrap();

        let reloaded = StatsLog::with_persistence(path);
        assert_eq!(reloaded.get(Counter::AlertsDispatched), 3);
        assert_eq!(reloaded.get(Counter::Sessions), 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = StatsLog::new().summary();
        assert!(summary.contains("Malformed packets dropped"));
        assert!(summary.contains("reconnect attempts"));
    }
}
