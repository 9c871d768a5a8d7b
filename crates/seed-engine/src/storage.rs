//! Seam over the object store tiles are written to.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;

/// Errors that prevent a write from producing any response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unreachable: {0}")]
    Transport(String),
    /// The target URL could not be built.
    #[error("invalid object url {0}")]
    InvalidUrl(String),
}

/// Status and body of a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, kept for error reporting.
    pub body: String,
}

impl PutResponse {
    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 5xx; worth retrying.
    pub fn is_transient(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// PUT-style object writes.
#[async_trait]
pub trait TileStore: Send + Sync {
    /// Write `body` under `path` with the given headers.
    async fn put(
        &self,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<PutResponse, StoreError>;

    /// Whether an object is already stored under `path`. Stores that cannot
    /// tell answer `false`, so the tile is rendered again.
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let _ = path;
        Ok(false)
    }
}

/// Writes objects with HTTP PUT to `{storage_url}{path_prefix}{path}`.
#[derive(Debug, Clone)]
pub struct HttpTileStore {
    http: reqwest::Client,
    storage_url: String,
    path_prefix: String,
}

impl HttpTileStore {
    /// Create a store client. A non-empty prefix without a leading slash gets one.
    pub fn new(http: reqwest::Client, storage_url: &str, path_prefix: &str) -> Self {
        let path_prefix = match path_prefix.trim_end_matches('/') {
            "" => String::new(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{p}"),
        };
        Self {
            http,
            storage_url: storage_url.trim_end_matches('/').to_string(),
            path_prefix,
        }
    }

    pub(crate) fn object_url(&self, path: &str) -> Result<Url, StoreError> {
        let raw = format!("{}{}{}", self.storage_url, self.path_prefix, path);
        Url::parse(&raw).map_err(|_| StoreError::InvalidUrl(raw))
    }
}

#[async_trait]
impl TileStore for HttpTileStore {
    async fn put(
        &self,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<PutResponse, StoreError> {
        let url = self.object_url(path)?;
        let mut req = self.http.put(url);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let res = req
            .body(body)
            .send()
            .await
            .map_err(|err| StoreError::Transport(format!("{err:#}")))?;
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Ok(PutResponse { status, body })
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let url = self.object_url(path)?;
        let res = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|err| StoreError::Transport(format!("{err:#}")))?;
        Ok(res.status().is_success())
    }
}
