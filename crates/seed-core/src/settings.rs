use serde::{Deserialize, Serialize};

/// Renderer parameters that can be overridden from the environment
/// (`METATILE`, `BUFFER_SIZE`, `TILE_SIZE`, `SCALE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub metatile: u32,
    pub buffer_size: u32,
    pub tile_size: u32,
    pub scale: u32,
}

impl RenderSettings {
    pub const DEFAULT_METATILE: u32 = 4;
    pub const DEFAULT_BUFFER_SIZE: u32 = 128;
    pub const DEFAULT_TILE_SIZE: u32 = 256;
    pub const DEFAULT_SCALE: u32 = 1;

    /// Settings for the `@2x` variant: buffer, tile size and scale doubled.
    pub fn for_retina(self, retina: bool) -> Self {
        if !retina {
            return self;
        }
        Self {
            metatile: self.metatile,
            buffer_size: self.buffer_size.saturating_mul(2),
            tile_size: self.tile_size.saturating_mul(2),
            scale: self.scale.saturating_mul(2),
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            metatile: Self::DEFAULT_METATILE,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            tile_size: Self::DEFAULT_TILE_SIZE,
            scale: Self::DEFAULT_SCALE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retina_doubles_pixel_parameters_only() {
        let base = RenderSettings::default();
        assert_eq!(base.for_retina(false), base);
        let hi = base.for_retina(true);
        assert_eq!(hi.metatile, 4);
        assert_eq!(hi.buffer_size, 256);
        assert_eq!(hi.tile_size, 512);
        assert_eq!(hi.scale, 2);
    }
}
