use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::range::RangeError;

/// A geographic bounding box in `[minLon, minLat, maxLon, maxLat]` order.
///
/// Serialized as a bare four-element array, which is how it travels inside
/// task payloads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// The whole Mercator world.
    pub const WORLD: BoundingBox = BoundingBox {
        min_lon: -180.0,
        min_lat: -90.0,
        max_lon: 180.0,
        max_lat: 90.0,
    };

    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, RangeError> {
        let bbox = Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    fn validate(&self) -> Result<(), RangeError> {
        let values = [self.min_lon, self.min_lat, self.max_lon, self.max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(RangeError::InvalidBoundingBox(format!("non-finite value in {self}")));
        }
        if !(-180.0..=180.0).contains(&self.min_lon) || !(-180.0..=180.0).contains(&self.max_lon) {
            return Err(RangeError::InvalidBoundingBox(format!("longitude out of range in {self}")));
        }
        if !(-90.0..=90.0).contains(&self.min_lat) || !(-90.0..=90.0).contains(&self.max_lat) {
            return Err(RangeError::InvalidBoundingBox(format!("latitude out of range in {self}")));
        }
        if self.min_lon > self.max_lon || self.min_lat > self.max_lat {
            return Err(RangeError::InvalidBoundingBox(format!("min exceeds max in {self}")));
        }
        Ok(())
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

impl TryFrom<[f64; 4]> for BoundingBox {
    type Error = RangeError;

    fn try_from(v: [f64; 4]) -> Result<Self, Self::Error> {
        BoundingBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        b.to_array()
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

/// Parses the CLI form `"minLon minLat maxLon maxLat"`; commas are accepted as separators too.
impl FromStr for BoundingBox {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() != 4 {
            return Err(RangeError::InvalidBoundingBox(format!(
                "expected 4 numbers, got {}: {s:?}",
                parts.len()
            )));
        }
        let mut values = [0.0f64; 4];
        for (slot, raw) in values.iter_mut().zip(parts) {
            *slot = raw
                .parse()
                .map_err(|_| RangeError::InvalidBoundingBox(format!("not a number: {raw:?}")))?;
        }
        BoundingBox::try_from(values)
    }
}
