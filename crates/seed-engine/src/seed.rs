//! Initial seeding of a bounding box.
//!
//! Only the top zoom is enqueued. Deeper zooms are reached by fan-out as the
//! workers complete each metatile.

use tileseed_core::{BoundingBox, RangeError, RenderTask, TaskError, tile_range};
use tracing::info;

use crate::broker::ChannelHandle;
use crate::queue::{QueueError, TaskQueue};

/// Parameters of one seeding run.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRequest {
    /// Area to render.
    pub bbox: BoundingBox,
    /// Zoom the seed tasks are created at.
    pub min_zoom: u8,
    /// Deepest zoom fan-out descends to.
    pub max_zoom: u8,
    /// Render `@2x` tiles.
    pub retina: bool,
    /// Style identifier carried by every task.
    pub style: String,
    /// Metatile edge length in tiles.
    pub metatile: u32,
    /// Tile size in pixels, used for the bbox projection.
    pub tile_size: u32,
    /// Attempt budget of each seed message.
    pub attempts: u32,
}

impl SeedRequest {
    /// Default attempt budget for seed and fan-out tasks.
    pub const DEFAULT_ATTEMPTS: u32 = 5;
}

/// Errors that stop a seeding run.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The bounding box or zoom is unusable.
    #[error(transparent)]
    Range(#[from] RangeError),
    /// A seed task could not be constructed.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// Enqueueing failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// `min_zoom` is deeper than `max_zoom`.
    #[error("min zoom {min} is greater than max zoom {max}")]
    ZoomOrder {
        /// Requested min zoom.
        min: u8,
        /// Requested max zoom.
        max: u8,
    },
}

/// Seed tasks covering `req.bbox` at `req.min_zoom`, in the order they would be enqueued.
pub fn seed_plan(req: &SeedRequest) -> Result<Vec<RenderTask>, SeedError> {
    if req.min_zoom > req.max_zoom {
        return Err(SeedError::ZoomOrder {
            min: req.min_zoom,
            max: req.max_zoom,
        });
    }
    if req.metatile == 0 {
        return Err(TaskError::ZeroMetatile.into());
    }
    let range = tile_range(&req.bbox, req.min_zoom, req.tile_size)?;
    range
        .metatile_corners(req.metatile)
        .into_iter()
        .map(|corner| {
            RenderTask::new(
                corner,
                req.metatile,
                req.retina,
                req.bbox,
                req.max_zoom,
                req.style.clone(),
            )
            .map_err(SeedError::from)
        })
        .collect()
}

/// Enqueue the seed tasks for `req` and return how many were submitted.
pub async fn seed_tasks(
    queue: &TaskQueue,
    channel: &ChannelHandle,
    req: &SeedRequest,
) -> Result<usize, SeedError> {
    let plan = seed_plan(req)?;
    let attempts = if req.attempts == 0 {
        SeedRequest::DEFAULT_ATTEMPTS
    } else {
        req.attempts
    };
    for task in &plan {
        queue.enqueue(channel, task, attempts, task.priority()).await?;
    }
    info!(
        channel = %channel.name,
        bbox = %req.bbox,
        min_zoom = req.min_zoom,
        max_zoom = req.max_zoom,
        tasks = plan.len(),
        "seeded"
    );
    Ok(plan.len())
}
