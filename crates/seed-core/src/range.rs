use std::f64::consts::PI;

use crate::bbox::BoundingBox;
use crate::tile::{MAX_ZOOM, TileCoord};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RangeError {
    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),
}

/// Inclusive rectangle of tile indices at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

/// Spherical-Mercator pixel position of a lon/lat pair at `zoom`, clamped to the world.
fn project(lon: f64, lat: f64, zoom: u8, tile_size: u32) -> (f64, f64) {
    let world = f64::from(tile_size) * 2f64.powi(i32::from(zoom));
    let half = world / 2.0;
    let px_per_degree = world / 360.0;
    let px_per_radian = world / (2.0 * PI);
    let f = lat.to_radians().sin().clamp(-0.9999, 0.9999);
    let x = (half + lon * px_per_degree).round();
    let y = (half + 0.5 * ((1.0 + f) / (1.0 - f)).ln() * -px_per_radian).round();
    (x.clamp(0.0, world), y.clamp(0.0, world))
}

/// Tiles covering `bbox` at `zoom` for tiles of `tile_size` pixels.
pub fn tile_range(bbox: &BoundingBox, zoom: u8, tile_size: u32) -> Result<TileRange, RangeError> {
    if zoom > MAX_ZOOM {
        return Err(RangeError::InvalidBoundingBox(format!(
            "zoom {zoom} exceeds {MAX_ZOOM}"
        )));
    }
    if tile_size == 0 {
        return Err(RangeError::InvalidBoundingBox("tile size must be > 0".to_string()));
    }
    let bbox = BoundingBox::new(bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat)?;

    let size = f64::from(tile_size);
    let last = (1u64 << zoom) as f64 - 1.0;
    let (ll_x, ll_y) = project(bbox.min_lon, bbox.min_lat, zoom, tile_size);
    let (ur_x, ur_y) = project(bbox.max_lon, bbox.max_lat, zoom, tile_size);

    let min_x = (ll_x / size).floor().clamp(0.0, last);
    let min_y = (ur_y / size).floor().clamp(0.0, last);
    // A degenerate box still covers the tile it sits in.
    let max_x = ((ur_x - 1.0) / size).floor().clamp(min_x, last);
    let max_y = ((ll_y - 1.0) / size).floor().clamp(min_y, last);

    Ok(TileRange {
        zoom,
        min_x: min_x as u32,
        max_x: max_x as u32,
        min_y: min_y as u32,
        max_y: max_y as u32,
    })
}

impl TileRange {
    pub fn contains(&self, tile: &TileCoord) -> bool {
        tile.z == self.zoom
            && (self.min_x..=self.max_x).contains(&tile.x)
            && (self.min_y..=self.max_y).contains(&tile.y)
    }

    pub fn tile_count(&self) -> u64 {
        u64::from(self.max_x - self.min_x + 1) * u64::from(self.max_y - self.min_y + 1)
    }

    /// Expands the rectangle outward to whole metatiles of `metatile_size`.
    ///
    /// The result may extend past the edge of the world grid; callers filter
    /// individual tiles with [`TileCoord::in_grid`].
    pub fn align(&self, metatile_size: u32) -> TileRange {
        let m = metatile_size.max(1);
        let min_x = self.min_x - self.min_x % m;
        let min_y = self.min_y - self.min_y % m;
        let round_up = |v: u32| (v / m).saturating_add(1).saturating_mul(m).saturating_sub(1);
        let max_x = round_up(self.max_x).max(min_x.saturating_add(m - 1));
        let max_y = round_up(self.max_y).max(min_y.saturating_add(m - 1));
        TileRange {
            zoom: self.zoom,
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    /// Top-left corners of every metatile intersecting this range, columns
    /// left to right and rows bottom to top.
    pub fn metatile_corners(&self, metatile_size: u32) -> Vec<TileCoord> {
        let m = metatile_size.max(1);
        let aligned = self.align(m);
        let mut out = Vec::new();
        let mut x = aligned.min_x;
        while x <= self.max_x {
            let mut y = self.max_y - self.max_y % m;
            loop {
                out.push(TileCoord::new(self.zoom, x, y));
                if y < aligned.min_y + m {
                    break;
                }
                y -= m;
            }
            x += m;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(s: &str) -> BoundingBox {
        s.parse().unwrap()
    }

    #[test]
    fn world_covers_whole_grid() {
        for z in 0..6u8 {
            let r = tile_range(&BoundingBox::WORLD, z, 256).unwrap();
            let last = (1u32 << z) - 1;
            assert_eq!((r.min_x, r.max_x, r.min_y, r.max_y), (0, last, 0, last), "z{z}");
        }
    }

    #[test]
    fn small_box_around_origin_straddles_center_tiles() {
        let r = tile_range(&bbox("-1 -1 1 1"), 2, 256).unwrap();
        assert_eq!((r.min_x, r.max_x, r.min_y, r.max_y), (1, 2, 1, 2));

        let r = tile_range(&bbox("1 1 2 2"), 2, 256).unwrap();
        assert_eq!((r.min_x, r.max_x, r.min_y, r.max_y), (2, 2, 1, 1));
    }

    #[test]
    fn tile_size_does_not_change_the_range() {
        let b = bbox("-122.5 37.7 -122.3 37.9");
        for z in [4u8, 10, 14] {
            let a = tile_range(&b, z, 256).unwrap();
            let c = tile_range(&b, z, 512).unwrap();
            assert_eq!(a, c, "z{z}");
        }
    }

    #[test]
    fn degenerate_box_still_yields_a_tile() {
        let r = tile_range(&bbox("0 0 0 0"), 3, 256).unwrap();
        assert!(r.max_x >= r.min_x && r.max_y >= r.min_y);
        assert_eq!(r.tile_count(), 1);
    }

    #[test]
    fn rejects_invalid_input() {
        let b = BoundingBox {
            min_lon: f64::NAN,
            min_lat: 0.0,
            max_lon: 1.0,
            max_lat: 1.0,
        };
        assert!(matches!(tile_range(&b, 3, 256), Err(RangeError::InvalidBoundingBox(_))));
        assert!(tile_range(&BoundingBox::WORLD, 31, 256).is_err());
        assert!(tile_range(&BoundingBox::WORLD, 3, 0).is_err());
    }

    #[test]
    fn aligned_range_is_a_superset_with_aligned_minimums() {
        let boxes = [
            "-1 -1 1 1",
            "-122.5 37.7 -122.3 37.9",
            "179.9 -10 180 10",
            "-180 -85 -179.99 -84.9",
            "10 50 30 60",
            "0 0 0 0",
        ];
        for raw in boxes {
            let b = bbox(raw);
            for z in 0..=12u8 {
                let r = tile_range(&b, z, 256).unwrap();
                for m in [1u32, 2, 4, 8] {
                    let a = r.align(m);
                    assert_eq!(a.min_x % m, 0, "{raw} z{z} m{m}");
                    assert_eq!(a.min_y % m, 0, "{raw} z{z} m{m}");
                    assert_eq!((a.max_x + 1) % m, 0, "{raw} z{z} m{m}");
                    assert_eq!((a.max_y + 1) % m, 0, "{raw} z{z} m{m}");
                    assert!(a.min_x <= r.min_x && a.max_x >= r.max_x, "{raw} z{z} m{m}");
                    assert!(a.min_y <= r.min_y && a.max_y >= r.max_y, "{raw} z{z} m{m}");
                    assert!(a.min_x <= a.max_x && a.min_y <= a.max_y);
                }
            }
        }
    }

    #[test]
    fn metatile_corners_cover_the_range() {
        let r = TileRange {
            zoom: 5,
            min_x: 3,
            max_x: 9,
            min_y: 6,
            max_y: 6,
        };
        let corners = r.metatile_corners(4);
        assert_eq!(
            corners,
            vec![
                TileCoord::new(5, 0, 4),
                TileCoord::new(5, 4, 4),
                TileCoord::new(5, 8, 4),
            ]
        );
        for x in r.min_x..=r.max_x {
            for y in r.min_y..=r.max_y {
                assert!(corners
                    .iter()
                    .any(|c| (c.x..c.x + 4).contains(&x) && (c.y..c.y + 4).contains(&y)));
            }
        }
    }

    #[test]
    fn narrow_range_yields_one_metatile() {
        let r = tile_range(&bbox("179.99 0 180 0.01"), 6, 256).unwrap();
        let corners = r.metatile_corners(4);
        assert_eq!(corners.len(), 1);
        assert!(corners[0].is_aligned(4));
    }

    #[test]
    fn corners_iterate_rows_bottom_up() {
        let r = TileRange {
            zoom: 3,
            min_x: 0,
            max_x: 1,
            min_y: 0,
            max_y: 1,
        };
        assert_eq!(
            r.metatile_corners(1),
            vec![
                TileCoord::new(3, 0, 1),
                TileCoord::new(3, 0, 0),
                TileCoord::new(3, 1, 1),
                TileCoord::new(3, 1, 0),
            ]
        );
    }
}
