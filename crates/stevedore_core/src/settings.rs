use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024; // 5 MiB
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB

/// Tunables for [`crate::UploadOrchestrator`], resolved once at startup.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: u32,
    /// Validity of the retrieval URL returned on completion.
    pub url_ttl_secs: u64,
    /// Scratch directory for part bodies on their way to the backend.
    pub temp_dir: PathBuf,
    /// Part uploads kept in flight by the single-call path. 1 uploads parts one after another.
    pub max_in_flight: usize,
    /// Largest accepted source. Enforced by whoever accepts the upload, not by the orchestrator.
    pub max_upload_size: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_factor: 2,
            url_ttl_secs: 3600,
            temp_dir: std::env::temp_dir(),
            max_in_flight: 1,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

impl UploadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_factor,
        )
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }
}
