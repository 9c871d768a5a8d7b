//! Seam over the tile rendering backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use tileseed_core::{RenderSettings, TileCoord};

/// Response headers forwarded from the rendering service to storage.
const FORWARDED_HEADERS: &[&str] = &["content-type", "content-encoding", "etag", "last-modified"];

/// Errors returned by a renderer.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The rendering service could not be reached.
    #[error("renderer unreachable: {0}")]
    Transport(String),
    /// The rendering service answered with a non-success status.
    #[error("renderer returned http {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// The renderer failed to produce the tile.
    #[error("render failed: {0}")]
    Failed(String),
}

/// Encoded tile plus the headers to store it with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedTile {
    /// Encoded image or grid body.
    pub body: Bytes,
    /// Headers reported by the renderer (e.g. `content-type`).
    pub headers: BTreeMap<String, String>,
}

/// Produces encoded tiles for a style.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render one image tile.
    async fn get_tile(&self, tile: TileCoord, retina: bool) -> Result<RenderedTile, RenderError>;

    /// Render the interactivity grid for a tile. `None` when the style has none.
    async fn get_grid(&self, tile: TileCoord) -> Result<Option<RenderedTile>, RenderError> {
        let _ = tile;
        Ok(None)
    }
}

/// Fetches tiles from an HTTP rendering service.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    http: reqwest::Client,
    base: Url,
    settings: RenderSettings,
}

impl HttpRenderer {
    /// Create a renderer client for the service at `base`.
    pub fn new(http: reqwest::Client, base: Url, settings: RenderSettings) -> Self {
        Self {
            http,
            base,
            settings,
        }
    }

    pub(crate) fn tile_url(&self, tile: TileCoord, retina: bool, ext: &str) -> Result<Url, RenderError> {
        let suffix = if retina { "@2x" } else { "" };
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RenderError::Failed(format!("render url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend([
                tile.z.to_string(),
                tile.x.to_string(),
                format!("{}{suffix}.{ext}", tile.y),
            ]);
        let s = self.settings.for_retina(retina);
        url.query_pairs_mut()
            .append_pair("metatile", &s.metatile.to_string())
            .append_pair("bufferSize", &s.buffer_size.to_string())
            .append_pair("tileSize", &s.tile_size.to_string())
            .append_pair("scale", &s.scale.to_string());
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> Result<reqwest::Response, RenderError> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| RenderError::Transport(format!("{err:#}")))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(RenderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(res)
    }
}

async fn into_rendered(res: reqwest::Response) -> Result<RenderedTile, RenderError> {
    let headers = res
        .headers()
        .iter()
        .filter(|(name, _)| FORWARDED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let body = res
        .bytes()
        .await
        .map_err(|err| RenderError::Transport(format!("{err:#}")))?;
    Ok(RenderedTile { body, headers })
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn get_tile(&self, tile: TileCoord, retina: bool) -> Result<RenderedTile, RenderError> {
        let url = self.tile_url(tile, retina, "png")?;
        into_rendered(self.fetch(url).await?).await
    }

    async fn get_grid(&self, tile: TileCoord) -> Result<Option<RenderedTile>, RenderError> {
        let url = self.tile_url(tile, false, "json")?;
        match self.fetch(url).await {
            Ok(res) => Ok(Some(into_rendered(res).await?)),
            Err(RenderError::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
