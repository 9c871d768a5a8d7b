use std::fmt;

use serde::{Deserialize, Serialize};

/// Deepest zoom level accepted anywhere in the pipeline.
pub const MAX_ZOOM: u8 = 30;

/// A tile address in the standard power-of-two XYZ grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub const fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles along one axis at this tile's zoom.
    pub fn grid_size(&self) -> u64 {
        1u64 << self.z.min(MAX_ZOOM)
    }

    /// Whether the coordinate exists in the grid at its zoom.
    pub fn in_grid(&self) -> bool {
        self.z <= MAX_ZOOM && u64::from(self.x) < self.grid_size() && u64::from(self.y) < self.grid_size()
    }

    /// The four tiles covering this tile at `z + 1`.
    pub fn children(&self) -> [TileCoord; 4] {
        let z = self.z + 1;
        let (x, y) = (self.x * 2, self.y * 2);
        [
            TileCoord::new(z, x, y),
            TileCoord::new(z, x + 1, y),
            TileCoord::new(z, x, y + 1),
            TileCoord::new(z, x + 1, y + 1),
        ]
    }

    /// Whether both coordinates sit on a metatile corner.
    pub fn is_aligned(&self, metatile_size: u32) -> bool {
        metatile_size > 0 && self.x % metatile_size == 0 && self.y % metatile_size == 0
    }

    /// Storage path for the rendered image, e.g. `/3/4/2.png` or `/3/4/2@2x.png`.
    pub fn image_path(&self, retina: bool, ext: &str) -> String {
        if retina {
            format!("/{}/{}/{}@2x.{ext}", self.z, self.x, self.y)
        } else {
            format!("/{}/{}/{}.{ext}", self.z, self.x, self.y)
        }
    }

    /// Storage path for the UTFGrid interactivity document.
    pub fn grid_path(&self) -> String {
        format!("/{}/{}/{}.json", self.z, self.x, self.y)
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}
