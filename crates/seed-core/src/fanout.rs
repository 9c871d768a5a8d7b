//! Quad-tree expansion of completed metatiles into the next zoom level.
//!
//! Only metatile-aligned children are produced; the other children of a tile
//! are rendered as part of the aligned sibling's metatile.

use crate::range::TileRange;
use crate::task::RenderTask;
use crate::tile::TileCoord;

/// Children of `tile` at `z + 1` whose coordinates are both multiples of `metatile_size`.
pub fn aligned_children(tile: TileCoord, metatile_size: u32) -> Vec<TileCoord> {
    tile.children()
        .into_iter()
        .filter(|c| c.is_aligned(metatile_size))
        .collect()
}

/// Child tasks to enqueue once `task` has been processed.
///
/// `covered` is the bbox tile range at the task's zoom. A metatile that does
/// not intersect it produces nothing, which is what stops descent outside the
/// seeded area. Inside it, every grid tile of the metatile contributes its
/// aligned children so the next zoom stays fully covered even when the bbox
/// only touches the metatile's far corner.
pub fn fan_out(task: &RenderTask, covered: &TileRange) -> Vec<RenderTask> {
    if task.tile.z >= task.max_zoom {
        return Vec::new();
    }
    if !task.tiles().any(|t| covered.contains(&t)) {
        return Vec::new();
    }

    let mut out: Vec<RenderTask> = Vec::new();
    for tile in task.tiles() {
        for child in aligned_children(tile, task.metatile_size) {
            if child.in_grid() && !out.iter().any(|t| t.tile == child) {
                out.push(task.with_tile(child));
            }
        }
    }
    out
}
