//! Sensor link layer.
//!
//! A [`Transport`] delivers opaque payloads per channel, in arrival order,
//! and reports when a subscription dies. The [`supervisor`] drives the
//! discover / subscribe / reconnect cycle on top of it.

pub mod scripted;
pub mod supervisor;
pub mod udp;

pub use scripted::{ScriptStep, ScriptedTransport};
pub use supervisor::{
    select_mode, ChannelStream, LinkState, LinkSupervisor, SessionEnd, SessionHandler, SessionInfo,
};
pub use udp::{UdpTransport, UdpTransportConfig};

use crate::core::types::Channel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of each per-channel payload queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Transport failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("failed to subscribe to {channel}: {message}")]
    Subscribe { channel: Channel, message: String },
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that happened on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Payload(Vec<u8>),
    /// The subscription is dead; no further events follow.
    Disconnected(String),
}

/// Identifies an active subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub channel: Channel,
}

/// An active subscription: its handle plus the event queue.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// The sensor link collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Look for the wanted channels for at most `timeout`; return those found.
    async fn discover(&self, wanted: &[Channel], timeout: Duration) -> Result<Vec<Channel>, LinkError>;

    async fn subscribe(&self, channel: Channel) -> Result<Subscription, LinkError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), LinkError>;
}

/// Supervisor timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bound on one discovery scan
    #[serde(with = "crate::config::duration_ms")]
    pub discovery_timeout: Duration,
    /// Fixed delay between reconnect attempts
    #[serde(with = "crate::config::duration_ms")]
    pub retry_delay: Duration,
    pub transport: TransportConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

/// Which transport to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Udp(UdpTransportConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Udp(UdpTransportConfig::default())
    }
}
