//! Retrying tile uploader.
//!
//! Uploads are detached from the task that produced them: a worker hands the
//! rendered body to [`Uploader::spawn`] and moves on. Failures are logged and
//! counted but never re-trigger the render.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};

use crate::storage::TileStore;

/// Exponential backoff for upload retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub factor: u32,
}

impl BackoffPolicy {
    /// Default retry count.
    pub const DEFAULT_RETRIES: u32 = 5;
    /// Default first delay.
    pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(50);
    /// Default delay cap.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(1000);

    /// Delay after the `n`-th consecutive failure (0-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = self.factor.max(1).saturating_pow(n);
        self.min_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: Self::DEFAULT_RETRIES,
            min_delay: Self::DEFAULT_MIN_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            factor: 2,
        }
    }
}

/// One object write, owned by the uploader for its whole attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    /// Object path below the store's prefix, e.g. `/3/4/5.png`.
    pub path: String,
    /// Headers sent with every attempt.
    pub headers: BTreeMap<String, String>,
    /// Object body.
    pub body: Bytes,
}

/// Upload failure after the retry policy gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// No attempt succeeded.
    #[error("upload of {path} failed after {attempts} attempt(s): {last_error}")]
    UploadFailed {
        /// Object path.
        path: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },
}

/// Headers every stored tile carries, on top of what the renderer reported.
///
/// `ext` is `png` for images and `json` for interactivity grids.
pub fn storage_headers(
    style: &str,
    z: u8,
    ext: &str,
    rendered: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut headers = rendered.clone();
    headers.insert("Cache-Control".into(), "public,max-age=3600".into());
    headers.insert("x-amz-acl".into(), "public-read".into());
    headers.insert("x-amz-storage-class".into(), "REDUCED_REDUNDANCY".into());
    headers.insert("x-amz-meta-Surrogate-Control".into(), "max-age=2592000".into());
    headers.insert(
        "x-amz-meta-Surrogate-Key".into(),
        format!("{style} z{z} {style}/z{z} {ext}"),
    );
    headers
}

#[derive(Debug, Default)]
struct PendingUploads {
    count: AtomicU64,
    idle: Notify,
}

/// Decrements the pending counter when a detached upload ends, however it ends.
struct PendingGuard(Arc<PendingUploads>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Writes tiles to a [`TileStore`] with retries.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn TileStore>,
    policy: BackoffPolicy,
    pending: Arc<PendingUploads>,
    failed: Arc<AtomicU64>,
    slots: Arc<Semaphore>,
}

impl Uploader {
    /// Default cap on detached uploads talking to the store at once.
    pub const DEFAULT_MAX_IN_FLIGHT: usize = 200;

    /// Create an uploader writing to `store`.
    pub fn new(store: Arc<dyn TileStore>, policy: BackoffPolicy) -> Self {
        Self {
            store,
            policy,
            pending: Arc::new(PendingUploads::default()),
            failed: Arc::new(AtomicU64::new(0)),
            slots: Arc::new(Semaphore::new(Self::DEFAULT_MAX_IN_FLIGHT)),
        }
    }

    /// Limit how many spawned uploads run at once; the rest wait for a slot.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.slots = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Uploads started with [`Self::spawn`] that have not finished yet,
    /// including those still waiting for a slot.
    pub fn pending(&self) -> u64 {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Resolve once no spawned upload is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Detached uploads that exhausted their retries.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Whether `path` is already stored. A failed check counts as missing.
    pub async fn exists(&self, path: &str) -> bool {
        match self.store.exists(path).await {
            Ok(found) => found,
            Err(err) => {
                debug!(path, error = %err, "existence check failed");
                false
            }
        }
    }

    /// Write `record`, retrying transport errors and 5xx responses.
    ///
    /// Returns the number of attempts made on success.
    pub async fn upload(&self, record: &UploadRecord) -> Result<u32, UploadError> {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let last_error = match self
                .store
                .put(&record.path, &record.headers, record.body.clone())
                .await
            {
                Ok(res) if res.is_success() => {
                    debug!(path = %record.path, attempts, "uploaded");
                    return Ok(attempts);
                }
                Ok(res) if !res.is_transient() => {
                    return Err(UploadError::UploadFailed {
                        path: record.path.clone(),
                        attempts,
                        last_error: format!("http {}: {}", res.status, res.body),
                    });
                }
                Ok(res) => format!("http {}: {}", res.status, res.body),
                Err(err) => err.to_string(),
            };

            if attempts > self.policy.retries {
                return Err(UploadError::UploadFailed {
                    path: record.path.clone(),
                    attempts,
                    last_error,
                });
            }
            let delay = self.policy.delay_for(attempts - 1);
            warn!(path = %record.path, attempts, error = %last_error, ?delay, "upload failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Run an upload in the background. The caller does not wait for it.
    pub fn spawn(&self, record: UploadRecord) {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(self.pending.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_slot) = this.slots.clone().acquire_owned().await else {
                return;
            };
            if let Err(err) = this.upload(&record).await {
                this.failed.fetch_add(1, Ordering::Relaxed);
                error!(path = %record.path, error = %err, "upload failed");
            }
        });
    }
}
