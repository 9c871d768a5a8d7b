use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::tile::{MAX_ZOOM, TileCoord};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("metatile size must be >= 1")]
    ZeroMetatile,
    #[error("task {tile} is not aligned to metatile size {metatile_size}")]
    Misaligned { tile: TileCoord, metatile_size: u32 },
    #[error("zoom {0} exceeds the deepest supported zoom")]
    ZoomOutOfRange(u8),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One unit of queued work: render the metatile whose top-left tile is `tile`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTask {
    pub tile: TileCoord,
    pub metatile_size: u32,
    pub retina: bool,
    pub bbox: BoundingBox,
    pub max_zoom: u8,
    pub style: String,
}

impl RenderTask {
    pub fn new(
        tile: TileCoord,
        metatile_size: u32,
        retina: bool,
        bbox: BoundingBox,
        max_zoom: u8,
        style: impl Into<String>,
    ) -> Result<Self, TaskError> {
        if metatile_size == 0 {
            return Err(TaskError::ZeroMetatile);
        }
        if tile.z > MAX_ZOOM {
            return Err(TaskError::ZoomOutOfRange(tile.z));
        }
        if max_zoom > MAX_ZOOM {
            return Err(TaskError::ZoomOutOfRange(max_zoom));
        }
        if !tile.is_aligned(metatile_size) {
            return Err(TaskError::Misaligned {
                tile,
                metatile_size,
            });
        }
        Ok(Self {
            tile,
            metatile_size,
            retina,
            bbox,
            max_zoom,
            style: style.into(),
        })
    }

    /// Queue priority; shallower zooms drain first.
    pub fn priority(&self) -> u32 {
        u32::from(self.tile.z)
    }

    /// Human-readable path of the corner tile, as carried in the payload `title`.
    pub fn title(&self) -> String {
        self.tile.image_path(self.retina, "png")
    }

    /// Every tile in this metatile that exists in the world grid.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let m = self.metatile_size;
        let TileCoord { z, x, y } = self.tile;
        (x..x.saturating_add(m))
            .flat_map(move |tx| (y..y.saturating_add(m)).map(move |ty| TileCoord::new(z, tx, ty)))
            .filter(TileCoord::in_grid)
    }

    /// A task for another metatile corner with the same seed parameters.
    pub fn with_tile(&self, tile: TileCoord) -> RenderTask {
        RenderTask {
            tile,
            ..self.clone()
        }
    }

    pub fn to_payload(&self) -> TaskPayload {
        TaskPayload {
            z: self.tile.z,
            x: self.tile.x,
            y: self.tile.y,
            metatile_size: self.metatile_size,
            retina: self.retina,
            bbox: self.bbox,
            max_zoom: self.max_zoom,
            style: self.style.clone(),
            title: self.title(),
        }
    }
}

/// Wire form of a [`RenderTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub metatile_size: u32,
    #[serde(default)]
    pub retina: bool,
    pub bbox: BoundingBox,
    pub max_zoom: u8,
    pub style: String,
    #[serde(default)]
    pub title: String,
}

impl TryFrom<TaskPayload> for RenderTask {
    type Error = TaskError;

    fn try_from(p: TaskPayload) -> Result<Self, Self::Error> {
        RenderTask::new(
            TileCoord::new(p.z, p.x, p.y),
            p.metatile_size,
            p.retina,
            p.bbox,
            p.max_zoom,
            p.style,
        )
    }
}

/// Message body as submitted to the broker: the attempt budget plus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub attempts: u32,
    pub data: TaskPayload,
}

impl Envelope {
    pub fn new(task: &RenderTask, attempts: u32) -> Self {
        Self {
            attempts,
            data: task.to_payload(),
        }
    }

    pub fn to_json(&self) -> Result<String, TaskError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a broker message body.
    pub fn decode(body: &str) -> Result<(u32, RenderTask), TaskError> {
        let env: Envelope = serde_json::from_str(body)?;
        let task = RenderTask::try_from(env.data)?;
        Ok((env.attempts, task))
    }
}
