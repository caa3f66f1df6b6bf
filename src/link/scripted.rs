//! Deterministic in-process transport.
//!
//! Each `discover` call consumes the next entry of the discovery script
//! (the last entry repeats once the script runs out). Each `subscribe` call
//! for a channel consumes that channel's next session script and plays it
//! step by step. A subscription whose script is exhausted stays open and
//! silent until unsubscribed.

use crate::core::types::Channel;
use crate::link::{
    LinkError, LinkEvent, Subscription, SubscriptionHandle, Transport, EVENT_QUEUE_CAPACITY,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One step of a channel session script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Payload(Vec<u8>),
    Delay(Duration),
    Disconnect(String),
}

#[derive(Default)]
struct ScriptState {
    discoveries: VecDeque<Vec<Channel>>,
    last_discovery: Vec<Channel>,
    sessions: HashMap<Channel, VecDeque<Vec<ScriptStep>>>,
    active: HashMap<u64, CancellationToken>,
    discover_calls: usize,
    subscribe_calls: Vec<Channel>,
    unsubscribed: Vec<SubscriptionHandle>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    next_id: AtomicU64,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next discovery scan.
    pub fn push_discovery(&self, found: &[Channel]) -> &Self {
        self.lock().discoveries.push_back(found.to_vec());
        self
    }

    /// Queue the script played by the next subscription to `channel`.
    pub fn push_session(&self, channel: Channel, steps: Vec<ScriptStep>) -> &Self {
        self.lock()
            .sessions
            .entry(channel)
            .or_default()
            .push_back(steps);
        self
    }

    pub fn discover_calls(&self) -> usize {
        self.lock().discover_calls
    }

    pub fn subscribe_calls(&self) -> Vec<Channel> {
        self.lock().subscribe_calls.clone()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.lock().unsubscribed.clone()
    }

    /// Subscriptions not yet unsubscribed.
    pub fn active_subscriptions(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn discover(&self, wanted: &[Channel], _timeout: Duration) -> Result<Vec<Channel>, LinkError> {
        let mut state = self.lock();
        state.discover_calls += 1;
        if let Some(next) = state.discoveries.pop_front() {
            state.last_discovery = next;
        }
        Ok(state
            .last_discovery
            .iter()
            .copied()
            .filter(|c| wanted.contains(c))
            .collect())
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription, LinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let steps = {
            let mut state = self.lock();
            state.subscribe_calls.push(channel);
            state.active.insert(id, cancel.clone());
            state
                .sessions
                .get_mut(&channel)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default()
        };

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            for step in steps {
                let event = match step {
                    ScriptStep::Delay(delay) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    ScriptStep::Payload(bytes) => LinkEvent::Payload(bytes),
                    ScriptStep::Disconnect(reason) => LinkEvent::Disconnected(reason),
                };
                let last = matches!(event, LinkEvent::Disconnected(_));
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(event) => if sent.is_err() || last { return },
                }
            }
            // Keep the queue open until unsubscribed.
            cancel.cancelled().await;
        });

        Ok(Subscription {
            handle: SubscriptionHandle { id, channel },
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), LinkError> {
        let mut state = self.lock();
        let token = state
            .active
            .remove(&handle.id)
            .ok_or(LinkError::UnknownSubscription(handle.id))?;
        token.cancel();
        state.unsubscribed.push(handle);
        Ok(())
    }
}
