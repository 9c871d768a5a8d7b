//! Transport-level seam over the remote message broker.
//!
//! The [`Broker`] trait mirrors the primitive operations of a lease-based
//! queue service (create channel, send, long-poll receive, delete, attribute
//! counts). [`crate::queue::TaskQueue`] layers envelopes and the attempt
//! budget on top of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors reported by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached or answered with a server error; retry later.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// The named channel does not exist.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    /// The broker answered with something this client does not understand.
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Resolved reference to a named channel on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    /// Channel name (one channel per style).
    pub name: String,
    /// Broker-side identifier used for subsequent calls.
    pub id: String,
}

/// A message as handed out by the broker, before envelope decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Broker-assigned message identifier.
    pub message_id: String,
    /// Receipt for this particular delivery; needed to delete the message.
    pub receipt: String,
    /// How many times this message has been handed out, including this delivery.
    pub delivery_count: u32,
    /// Opaque message body.
    pub body: String,
}

/// Approximate channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    /// Visible messages waiting to be leased.
    pub queued: u64,
    /// Leased messages not yet deleted.
    pub in_flight: u64,
}

/// Primitive operations of a lease-based message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the channel if it does not exist; return its handle either way.
    async fn create_channel(&self, name: &str, lease: Duration)
    -> Result<ChannelHandle, BrokerError>;

    /// Submit a message body. `priority` is a hint; lower values are preferred.
    async fn send(
        &self,
        channel: &ChannelHandle,
        body: String,
        priority: u32,
    ) -> Result<String, BrokerError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait` for the first one.
    async fn receive(
        &self,
        channel: &ChannelHandle,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    /// Delete a message by delivery receipt. Unknown receipts are not an error.
    async fn delete(&self, channel: &ChannelHandle, receipt: &str) -> Result<(), BrokerError>;

    /// Read the approximate channel counters.
    async fn counts(&self, channel: &ChannelHandle) -> Result<ChannelCounts, BrokerError>;

    /// Remove the channel and everything in it.
    async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), BrokerError>;
}
