#![forbid(unsafe_code)]

//! Domain types shared by the `tileseed` engine and CLI: tile coordinates,
//! bounding boxes, metatile-aligned tile ranges, render tasks and the
//! quad-tree fan-out rule.

pub mod bbox;
pub mod fanout;
pub mod range;
pub mod settings;
pub mod task;
pub mod tile;

pub use bbox::BoundingBox;
pub use fanout::{aligned_children, fan_out};
pub use range::{RangeError, TileRange, tile_range};
pub use settings::RenderSettings;
pub use task::{Envelope, RenderTask, TaskError, TaskPayload};
pub use tile::{MAX_ZOOM, TileCoord};
