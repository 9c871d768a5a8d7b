//! Public API types for the in-process worker engine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tileseed_core::TileCoord;

use crate::queue::TaskQueue;
use crate::renderer::Renderer;
use crate::uploader::Uploader;

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Channel to consume (one channel per style).
    pub channel: String,

    /// Number of tasks processed concurrently (`C`).
    pub parallel: usize,

    /// Long-poll wait for each receive call.
    pub receive_wait: Duration,

    /// How long the poll loop backs off after a broker error.
    pub idle_sleep: Duration,

    /// How often channel counters are sampled and drain is checked.
    pub status_interval: Duration,

    /// Stop once the broker and local counters are all zero.
    pub exit_on_drain: bool,

    /// Attempt budget given to fan-out children.
    pub child_attempts: u32,

    /// Tile size used to clip metatiles against the task bbox.
    pub tile_size: u32,

    /// Also render and upload interactivity grids.
    pub interactivity: bool,

    /// Leave tiles the store already holds instead of rendering them again.
    pub skip_existing: bool,

    /// Maximum number of finished tasks retained in the snapshot.
    pub recent_tasks_max: usize,
}

impl EngineConfig {
    /// Default long-poll wait.
    pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(5);

    /// Default backoff after a failed receive.
    pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_secs(5);

    /// Default status/drain sampling interval.
    pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

    /// Default attempt budget for fan-out children.
    pub const DEFAULT_CHILD_ATTEMPTS: u32 = 5;

    /// Default size of the recent-tasks ring buffer.
    pub const DEFAULT_RECENT_TASKS_MAX: usize = 100;

    /// Receive batches never exceed this many messages.
    pub const MAX_RECEIVE_BATCH: usize = 10;

    /// Config with defaults for everything but the channel and concurrency.
    pub fn new(channel: impl Into<String>, parallel: usize) -> Self {
        Self {
            channel: channel.into(),
            parallel,
            receive_wait: Self::DEFAULT_RECEIVE_WAIT,
            idle_sleep: Self::DEFAULT_IDLE_SLEEP,
            status_interval: Self::DEFAULT_STATUS_INTERVAL,
            exit_on_drain: false,
            child_attempts: Self::DEFAULT_CHILD_ATTEMPTS,
            tile_size: tileseed_core::RenderSettings::DEFAULT_TILE_SIZE,
            interactivity: false,
            skip_existing: false,
            recent_tasks_max: Self::DEFAULT_RECENT_TASKS_MAX,
        }
    }
}

/// Collaborators the engine drives. All are passed in explicitly.
#[derive(Clone)]
pub struct EngineDeps {
    /// Task queue bound to a broker.
    pub queue: Arc<TaskQueue>,
    /// Tile renderer.
    pub renderer: Arc<dyn Renderer>,
    /// Retrying uploader for rendered tiles.
    pub uploader: Uploader,
}

/// A lightweight summary of a leased render task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSummary {
    /// Broker message id.
    pub message_id: String,
    /// Metatile corner.
    pub tile: TileCoord,
    /// Metatile edge length.
    pub metatile_size: u32,
    /// Whether `@2x` tiles are rendered.
    pub retina: bool,
    /// Broker delivery count for this lease.
    pub delivery_count: u32,
}

/// Stage of a worker in the task lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStage {
    /// No task assigned (idle).
    Idle,
    /// Rendering the tiles of a metatile.
    Rendering,
    /// Enqueueing fan-out children.
    Scheduling,
    /// Deleting the message from the broker.
    Acknowledging,
}

/// Snapshot of a single worker's current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker index (0-based).
    pub worker_idx: usize,
    /// Current stage.
    pub stage: WorkerStage,
    /// Current task, if any.
    pub task: Option<TaskSummary>,
}

/// Result of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Worker index (0-based).
    pub worker_idx: usize,
    /// Task metadata.
    pub task: TaskSummary,
    /// Tiles of the metatile inside the bbox that rendered successfully.
    pub tiles_rendered: u32,
    /// Tiles that failed to render.
    pub render_errors: u32,
    /// Tiles left alone because the store already had them.
    #[serde(default)]
    pub tiles_skipped: u32,
    /// Fan-out children enqueued.
    pub children_enqueued: u32,
    /// Whether the message was deleted from the broker.
    pub acknowledged: bool,
    /// Human-readable failure, when the task did not complete normally.
    pub error: Option<String>,
    /// Total task time (milliseconds).
    pub total_ms: u64,
    /// Wall-clock completion time (unix seconds).
    pub finished_at: i64,
}

/// Broker and local counters sampled on the status interval.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    /// Visible messages on the broker.
    pub queued: u64,
    /// Leased, unacknowledged messages on the broker.
    pub in_flight: u64,
    /// Tasks running on local workers.
    pub running: u64,
    /// Leased tasks waiting for a local worker.
    pub pending: u64,
    /// Detached uploads not yet finished.
    pub pending_uploads: u64,
    /// Messages dropped by the poison/parse policy since start.
    pub discarded: u64,
}

impl QueueStatus {
    /// Nothing queued, leased, running, pending or uploading.
    pub fn is_drained(&self) -> bool {
        self.queued == 0
            && self.in_flight == 0
            && self.running == 0
            && self.pending == 0
            && self.pending_uploads == 0
    }
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Engine is stopping (graceful shutdown requested).
    StopRequested,
    /// Worker has been assigned a new task.
    WorkerTaskStarted {
        /// Worker index (0-based).
        worker_idx: usize,
        /// Task summary.
        task: TaskSummary,
    },
    /// Worker stage transition.
    WorkerStage {
        /// Worker index (0-based).
        worker_idx: usize,
        /// New stage.
        stage: WorkerStage,
    },
    /// Worker finished a task (success or failure).
    TaskFinished {
        /// Task outcome.
        outcome: TaskOutcome,
    },
    /// Periodic counters.
    Status {
        /// Sampled counters.
        status: QueueStatus,
    },
    /// Broker and local counters were all zero; the engine is stopping.
    Drained,
    /// A warning from the engine.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped (no more workers running).
    Stopped,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Per-worker snapshots.
    pub workers: Vec<WorkerSnapshot>,
    /// Recently finished tasks (newest last).
    pub recent_tasks: Vec<TaskOutcome>,
    /// Last sampled counters, if any.
    pub status: Option<QueueStatus>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance.
pub fn start_engine(config: EngineConfig, deps: EngineDeps) -> EngineHandle {
    crate::engine::start_engine(config, deps)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown (finish running tasks, stop leasing new ones).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
