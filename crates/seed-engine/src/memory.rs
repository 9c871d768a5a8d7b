//! In-process broker with lease semantics.
//!
//! Used by the single-process `run` mode and by tests. Every delivery gets a
//! fresh receipt and a visibility deadline; a message whose deadline passes
//! without a delete becomes visible again with its delivery count bumped on
//! the next receive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerError, ChannelCounts, ChannelHandle, RawMessage};

#[derive(Debug)]
struct StoredMessage {
    body: String,
    priority: u32,
    delivery_count: u32,
    receipt: Option<String>,
    leased_until: Option<Instant>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.leased_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug)]
struct MemoryChannel {
    lease: Duration,
    messages: BTreeMap<u64, StoredMessage>,
}

#[derive(Debug, Default)]
struct MemoryState {
    channels: HashMap<String, MemoryChannel>,
    next_id: u64,
}

/// Lease-based broker held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another caller panicked mid-update; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease up to `max` visible messages. Returns the batch plus the earliest
    /// outstanding lease deadline, which is when the next message may reappear.
    fn try_lease(
        &self,
        channel: &str,
        max: usize,
        now: Instant,
    ) -> Result<(Vec<RawMessage>, Option<Instant>), BrokerError> {
        let mut state = self.lock();
        let chan = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.to_string()))?;

        let mut visible: Vec<(u32, u64)> = chan
            .messages
            .iter()
            .filter(|(_, m)| m.is_visible(now))
            .map(|(id, m)| (m.priority, *id))
            .collect();
        visible.sort_unstable();

        let lease = chan.lease;
        let mut batch = Vec::new();
        for (_, id) in visible.into_iter().take(max) {
            let Some(msg) = chan.messages.get_mut(&id) else {
                continue;
            };
            msg.delivery_count += 1;
            let receipt = format!("{id}-{}", msg.delivery_count);
            msg.receipt = Some(receipt.clone());
            msg.leased_until = Some(now + lease);
            batch.push(RawMessage {
                message_id: id.to_string(),
                receipt,
                delivery_count: msg.delivery_count,
                body: msg.body.clone(),
            });
        }

        let next_expiry = chan
            .messages
            .values()
            .filter_map(|m| m.leased_until.filter(|until| *until > now))
            .min();
        Ok((batch, next_expiry))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_channel(
        &self,
        name: &str,
        lease: Duration,
    ) -> Result<ChannelHandle, BrokerError> {
        let mut state = self.lock();
        state
            .channels
            .entry(name.to_string())
            .or_insert_with(|| MemoryChannel {
                lease,
                messages: BTreeMap::new(),
            });
        Ok(ChannelHandle {
            name: name.to_string(),
            id: name.to_string(),
        })
    }

    async fn send(
        &self,
        channel: &ChannelHandle,
        body: String,
        priority: u32,
    ) -> Result<String, BrokerError> {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            let chan = state
                .channels
                .get_mut(&channel.id)
                .ok_or_else(|| BrokerError::ChannelNotFound(channel.name.clone()))?;
            chan.messages.insert(
                id,
                StoredMessage {
                    body,
                    priority,
                    delivery_count: 0,
                    receipt: None,
                    leased_until: None,
                },
            );
            id
        };
        self.notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn receive(
        &self,
        channel: &ChannelHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let max_messages = max_messages.max(1);
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (batch, next_expiry) = self.try_lease(&channel.id, max_messages, now)?;
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, channel: &ChannelHandle, receipt: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(chan) = state.channels.get_mut(&channel.id) else {
            return Ok(());
        };
        let found = chan
            .messages
            .iter()
            .find(|(_, m)| m.receipt.as_deref() == Some(receipt))
            .map(|(id, _)| *id);
        if let Some(id) = found {
            chan.messages.remove(&id);
        }
        Ok(())
    }

    async fn counts(&self, channel: &ChannelHandle) -> Result<ChannelCounts, BrokerError> {
        let state = self.lock();
        let chan = state
            .channels
            .get(&channel.id)
            .ok_or_else(|| BrokerError::ChannelNotFound(channel.name.clone()))?;
        let now = Instant::now();
        let mut counts = ChannelCounts::default();
        for msg in chan.messages.values() {
            if msg.is_visible(now) {
                counts.queued += 1;
            } else {
                counts.in_flight += 1;
            }
        }
        Ok(counts)
    }

    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), BrokerError> {
        self.lock().channels.remove(&channel.id);
        Ok(())
    }
}
