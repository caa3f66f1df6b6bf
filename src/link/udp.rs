//! UDP transport: one socket per channel.
//!
//! Meant to sit behind a BLE bridge that forwards every sensor notification
//! as one datagram. A channel counts as "found" once its socket has received
//! a datagram; a subscription is considered dead after `silence_timeout`
//! without traffic.

use crate::core::types::Channel;
use crate::link::{
    LinkError, LinkEvent, Subscription, SubscriptionHandle, Transport, EVENT_QUEUE_CAPACITY,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 2048;

/// Listen addresses and liveness timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpTransportConfig {
    pub hip_addr: String,
    pub leg_addr: String,
    #[serde(with = "crate::config::duration_ms")]
    pub silence_timeout: Duration,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            hip_addr: "0.0.0.0:5601".to_string(),
            leg_addr: "0.0.0.0:5602".to_string(),
            silence_timeout: Duration::from_secs(5),
        }
    }
}

impl UdpTransportConfig {
    pub fn addr(&self, channel: Channel) -> &str {
        match channel {
            Channel::Hip => &self.hip_addr,
            Channel::Leg => &self.leg_addr,
        }
    }
}

pub struct UdpTransport {
    config: UdpTransportConfig,
    sockets: Mutex<HashMap<Channel, Arc<UdpSocket>>>,
    /// First datagram seen during discovery, replayed on subscribe
    pending: Arc<Mutex<HashMap<Channel, Vec<u8>>>>,
    readers: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Self {
        Self {
            config,
            sockets: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            readers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The bound socket for `channel`, binding it on first use.
    async fn socket(&self, channel: Channel) -> Result<Arc<UdpSocket>, LinkError> {
        if let Some(socket) = self.lock_sockets().get(&channel) {
            return Ok(socket.clone());
        }
        let socket = Arc::new(UdpSocket::bind(self.config.addr(channel)).await?);
        tracing::debug!(%channel, addr = %socket.local_addr()?, "bound sensor socket");
        Ok(self
            .lock_sockets()
            .entry(channel)
            .or_insert(socket)
            .clone())
    }

    /// Local address of a channel's socket, once bound.
    pub fn local_addr(&self, channel: Channel) -> Option<std::net::SocketAddr> {
        self.lock_sockets()
            .get(&channel)
            .and_then(|s| s.local_addr().ok())
    }

    fn lock_sockets(&self) -> std::sync::MutexGuard<'_, HashMap<Channel, Arc<UdpSocket>>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn discover(&self, wanted: &[Channel], timeout: Duration) -> Result<Vec<Channel>, LinkError> {
        let mut probes = JoinSet::new();
        for &channel in wanted {
            let socket = self.socket(channel).await?;
            let pending = self.pending.clone();
            probes.spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        pending
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(channel, buf);
                        Some(channel)
                    }
                    _ => None,
                }
            });
        }

        let mut found = Vec::new();
        while let Some(result) = probes.join_next().await {
            if let Ok(Some(channel)) = result {
                found.push(channel);
            }
        }
        found.sort();
        Ok(found)
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription, LinkError> {
        let socket = self.socket(channel).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        self.readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, cancel.clone());

        let first = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&channel);
        let silence = self.config.silence_timeout;

        tokio::spawn(async move {
            if let Some(payload) = first {
                if tx.send(LinkEvent::Payload(payload)).await.is_err() {
                    return;
                }
            }
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = tokio::time::timeout(silence, socket.recv(&mut buf)) => match received {
                        Ok(Ok(n)) => LinkEvent::Payload(buf[..n].to_vec()),
                        Ok(Err(e)) => LinkEvent::Disconnected(format!("socket error: {e}")),
                        Err(_) => LinkEvent::Disconnected(format!(
                            "no data from {channel} for {} ms",
                            silence.as_millis()
                        )),
                    },
                };
                let last = matches!(event, LinkEvent::Disconnected(_));
                if tx.send(event).await.is_err() || last {
                    break;
                }
            }
            tracing::debug!(%channel, id, "udp reader stopped");
        });

        Ok(Subscription {
            handle: SubscriptionHandle { id, channel },
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), LinkError> {
        let token = self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id)
            .ok_or(LinkError::UnknownSubscription(handle.id))?;
        token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> UdpTransportConfig {
        UdpTransportConfig {
            hip_addr: "127.0.0.1:0".to_string(),
            leg_addr: "127.0.0.1:0".to_string(),
            silence_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_discovery_finds_only_talking_channels() {
        let transport = UdpTransport::new(loopback_config());
        // Bind both sockets so the sender knows where to go.
        transport.socket(Channel::Hip).await.unwrap();
        transport.socket(Channel::Leg).await.unwrap();
        let hip = transport.local_addr(Channel::Hip).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"1,2,3,4,5,6", hip).await.unwrap();

        let found = transport
            .discover(&Channel::ALL, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(found, vec![Channel::Hip]);
    }

    #[tokio::test]
    async fn test_subscription_delivers_then_times_out() {
        let transport = UdpTransport::new(loopback_config());
        let mut sub = transport.subscribe(Channel::Leg).await.unwrap();
        let leg = transport.local_addr(Channel::Leg).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"hello", leg).await.unwrap();

        assert_eq!(sub.events.recv().await, Some(LinkEvent::Payload(b"hello".to_vec())));
        assert!(matches!(sub.events.recv().await, Some(LinkEvent::Disconnected(_))));
        transport.unsubscribe(sub.handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_unsubscribe() {
        let transport = UdpTransport::new(loopback_config());
        let handle = SubscriptionHandle {
            id: 99,
            channel: Channel::Hip,
        };
        assert!(matches!(
            transport.unsubscribe(handle).await,
            Err(LinkError::UnknownSubscription(99))
        ));
    }
}
