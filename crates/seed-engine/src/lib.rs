#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Work distribution for `tileseed`: broker seam, task queue, seeding, and the
//! in-process worker engine (lease, render, fan out, acknowledge, upload).

/// Public API for the engine crate.
pub mod api;

pub mod broker;
pub mod http_broker;
pub mod memory;
pub mod queue;
pub mod renderer;
pub mod seed;
pub mod storage;
pub mod uploader;

mod engine;
mod worker;

pub use api::{
    EngineConfig, EngineDeps, EngineEvent, EngineHandle, QueueStatus, StatusSnapshot,
    TaskOutcome, TaskSummary, WorkerSnapshot, WorkerStage, start_engine,
};
pub use broker::{Broker, BrokerError, ChannelCounts, ChannelHandle, RawMessage};
pub use http_broker::HttpBroker;
pub use memory::MemoryBroker;
pub use queue::{Discard, LeaseHandle, LeasedMessage, QueueError, TaskQueue};
pub use renderer::{HttpRenderer, RenderError, RenderedTile, Renderer};
pub use seed::{SeedError, SeedRequest, seed_plan, seed_tasks};
pub use storage::{HttpTileStore, PutResponse, StoreError, TileStore};
pub use uploader::{BackoffPolicy, UploadError, UploadRecord, Uploader, storage_headers};
