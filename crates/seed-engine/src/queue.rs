//! Render-task queue on top of a [`Broker`].
//!
//! Owns the message lifecycle: envelopes go out through [`TaskQueue::enqueue`],
//! come back as [`LeasedMessage`]s from [`TaskQueue::receive`] and leave through
//! [`TaskQueue::acknowledge`]. Messages that exceed their attempt budget or fail
//! to decode are deleted here and never reach a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tileseed_core::{Envelope, RenderTask, TaskError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, ChannelCounts, ChannelHandle, RawMessage};

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The underlying broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// A task could not be serialized into an envelope.
    #[error("encode task: {0}")]
    Task(#[from] TaskError),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Broker(err) => err.is_transient(),
            QueueError::Task(_) => false,
        }
    }
}

/// Why a delivered message was dropped instead of handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Discard {
    /// The body is not a valid envelope.
    #[error("unparseable message: {0}")]
    MessageParse(String),
    /// The message was delivered more often than its envelope allows.
    #[error("attempt budget exceeded ({delivery_count} deliveries, budget {attempts})")]
    AttemptBudgetExceeded {
        /// Broker delivery count, including the current delivery.
        delivery_count: u32,
        /// Budget from the envelope.
        attempts: u32,
    },
}

/// Token needed to acknowledge one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    /// Channel the message was received from.
    pub channel: ChannelHandle,
    /// Broker receipt for this delivery.
    pub receipt: String,
}

/// A decoded message currently leased by this process.
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    /// Broker-assigned message id.
    pub message_id: String,
    /// Handle for [`TaskQueue::acknowledge`].
    pub lease: LeaseHandle,
    /// Delivery count reported by the broker.
    pub delivery_count: u32,
    /// Attempt budget carried by the envelope.
    pub attempts: u32,
    /// The render task.
    pub task: RenderTask,
    /// Local lease deadline; past it, another consumer may hold the message.
    pub lease_expires_at: Instant,
}

impl LeasedMessage {
    /// Whether the local lease deadline has passed.
    pub fn lease_expired(&self) -> bool {
        Instant::now() >= self.lease_expires_at
    }
}

/// Queue client bound to one broker and one lease duration.
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    lease: Duration,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    discarded: AtomicU64,
}

impl TaskQueue {
    /// Default visibility window.
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(150);

    /// Create a queue client. A zero lease falls back to [`Self::DEFAULT_LEASE`].
    pub fn new(broker: Arc<dyn Broker>, lease: Duration) -> Self {
        let lease = if lease.is_zero() {
            Self::DEFAULT_LEASE
        } else {
            lease
        };
        Self {
            broker,
            lease,
            channels: Mutex::new(HashMap::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Lease duration requested for new channels.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Messages dropped by the poison/parse policy since this queue was created.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Create the channel if needed and return its handle. Handles are cached.
    pub async fn ensure_channel(&self, name: &str) -> Result<ChannelHandle, QueueError> {
        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }
        let handle = self.broker.create_channel(name, self.lease).await?;
        if let Ok(mut map) = self.channels.lock() {
            map.insert(name.to_string(), handle.clone());
        }
        Ok(handle)
    }

    fn cached(&self, name: &str) -> Option<ChannelHandle> {
        self.channels.lock().ok()?.get(name).cloned()
    }

    /// Submit `task` wrapped in an envelope with the given attempt budget.
    pub async fn enqueue(
        &self,
        channel: &ChannelHandle,
        task: &RenderTask,
        attempts: u32,
        priority: u32,
    ) -> Result<String, QueueError> {
        let body = Envelope::new(task, attempts).to_json()?;
        let id = self.broker.send(channel, body, priority).await?;
        debug!(channel = %channel.name, message_id = %id, tile = %task.tile, attempts, "enqueued");
        Ok(id)
    }

    /// Long-poll for up to `max_batch` messages.
    ///
    /// Poison and unparseable messages are deleted and left out of the result.
    pub async fn receive(
        &self,
        channel: &ChannelHandle,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError> {
        let raw = self.broker.receive(channel, max_batch, wait).await?;
        let expires_at = Instant::now() + self.lease;

        let mut out = Vec::with_capacity(raw.len());
        for msg in raw {
            match classify(&msg) {
                Ok((attempts, task)) => {
                    debug!(
                        channel = %channel.name,
                        message_id = %msg.message_id,
                        tile = %task.tile,
                        delivery_count = msg.delivery_count,
                        "leased"
                    );
                    out.push(LeasedMessage {
                        message_id: msg.message_id,
                        lease: LeaseHandle {
                            channel: channel.clone(),
                            receipt: msg.receipt,
                        },
                        delivery_count: msg.delivery_count,
                        attempts,
                        task,
                        lease_expires_at: expires_at,
                    });
                }
                Err(reason) => self.discard(channel, &msg, reason).await,
            }
        }
        Ok(out)
    }

    async fn discard(&self, channel: &ChannelHandle, msg: &RawMessage, reason: Discard) {
        warn!(channel = %channel.name, message_id = %msg.message_id, %reason, "discarding message");
        match self.broker.delete(channel, &msg.receipt).await {
            Ok(()) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // Redelivery brings it back here and the delete is retried.
                warn!(channel = %channel.name, message_id = %msg.message_id, error = %err, "discard delete failed");
            }
        }
    }

    /// Delete the message behind `lease`. Acknowledging twice is not an error.
    pub async fn acknowledge(&self, lease: &LeaseHandle) -> Result<(), QueueError> {
        self.broker.delete(&lease.channel, &lease.receipt).await?;
        Ok(())
    }

    /// Best-effort channel counters.
    pub async fn counts(&self, channel: &ChannelHandle) -> Result<ChannelCounts, QueueError> {
        Ok(self.broker.counts(channel).await?)
    }

    /// Drop the channel and everything queued in it.
    pub async fn delete_channel(&self, channel: &ChannelHandle) -> Result<(), QueueError> {
        self.broker.delete_channel(channel).await?;
        if let Ok(mut map) = self.channels.lock() {
            map.remove(&channel.name);
        }
        Ok(())
    }
}

fn classify(msg: &RawMessage) -> Result<(u32, RenderTask), Discard> {
    let (attempts, task) =
        Envelope::decode(&msg.body).map_err(|err| Discard::MessageParse(err.to_string()))?;
    if msg.delivery_count > attempts {
        return Err(Discard::AttemptBudgetExceeded {
            delivery_count: msg.delivery_count,
            attempts,
        });
    }
    Ok((attempts, task))
}
