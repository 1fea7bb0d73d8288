use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::{Error, Result};
use super::{Chunk, Key, ObjectStore, S3_MIN_PART_SIZE};

fn default_min_part_size() -> u64 {
    S3_MIN_PART_SIZE
}

fn default_bucket_name() -> String {
    String::from("stevedore")
}

#[derive(Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_bucket_name")]
    bucket_name: String,
    #[serde(default = "default_min_part_size")]
    min_part_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            bucket_name: default_bucket_name(),
            min_part_size: default_min_part_size(),
        }
    }
}

impl MemoryConfig {
    pub fn new_objects(&self) -> MemoryStore {
        MemoryStore::new(&self.bucket_name, self.min_part_size)
    }
}

struct PendingUpload {
    key: Key,
    content_type: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

struct StoredObject {
    content_type: String,
    body: Bytes,
}

struct IssuedUrl {
    key: Key,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<Key, StoredObject>,
    urls: HashMap<String, IssuedUrl>,
}

/// Multipart upload protocol held entirely in process memory.
///
/// Follows the S3 rules that matter to a client: parts are keyed by part number and may be
/// re-uploaded, completion must list parts in ascending order with the ETags the store handed out,
/// and every part but the last must be at least [`MemoryStore::min_part_size`] bytes.
///
/// Retrieval URLs expire according to the tokio clock so that tests can pause and advance time.
#[derive(Clone)]
pub struct MemoryStore {
    bucket_name: String,
    min_part_size: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(bucket_name: &str, min_part_size: u64) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            min_part_size,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Unavailable(String::from("memory store lock poisoned")))
    }

    /// Resolve a URL previously returned by [`ObjectStore::presign_get`].
    pub fn fetch(&self, url: &str) -> Result<Bytes> {
        let token = url
            .rsplit_once("?token=")
            .map(|(_, t)| t)
            .ok_or_else(|| Error::UnknownUrl(url.to_string()))?;
        let state = self.state()?;
        let issued = state
            .urls
            .get(token)
            .ok_or_else(|| Error::UnknownUrl(url.to_string()))?;
        if Instant::now() >= issued.expires_at {
            return Err(Error::UrlExpired);
        }
        state
            .objects
            .get(&issued.key)
            .map(|o| o.body.clone())
            .ok_or_else(|| Error::UnknownObject(issued.key.to_string()))
    }

    pub fn object(&self, key: &Key) -> Option<Bytes> {
        self.state().ok()?.objects.get(key).map(|o| o.body.clone())
    }

    pub fn content_type(&self, key: &Key) -> Option<String> {
        self.state()
            .ok()?
            .objects
            .get(key)
            .map(|o| o.content_type.clone())
    }

    /// Number of multipart uploads that were created and neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state().map(|s| s.uploads.len()).unwrap_or(0)
    }
}

fn e_tag(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("\"{hex}\"")
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    async fn initiate_chunked_upload(&self, key: &Key, content_type: &str) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.state()?.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.clone(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        tracing::debug!(bucket = %self.bucket_name, %key, %upload_id, "created upload");
        Ok(upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &Key,
        chunk_number: i32,
        path: &Path,
    ) -> Result<Chunk> {
        if !(1..=10_000).contains(&chunk_number) {
            return Err(Error::InvalidPart {
                chunk_number,
                reason: "part numbers must be between 1 and 10000",
            });
        }
        let body = Bytes::from(tokio::fs::read(path).await?);
        let tag = e_tag(&body);

        let mut state = self.state()?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| &u.key == key)
            .ok_or_else(|| Error::UnknownUpload(upload_id.to_string()))?;
        upload.parts.insert(chunk_number, (tag.clone(), body));

        Ok(Chunk {
            e_tag: Some(tag),
            chunk_number,
        })
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        key: &Key,
        chunks: Vec<Chunk>,
    ) -> Result<()> {
        let mut state = self.state()?;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| &u.key == key)
            .ok_or_else(|| Error::UnknownUpload(upload_id.to_string()))?;

        if chunks.is_empty() {
            return Err(Error::InvalidPart {
                chunk_number: 0,
                reason: "at least one part is required",
            });
        }

        let mut body = BytesMut::new();
        let mut previous = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.chunk_number <= previous {
                return Err(Error::InvalidPart {
                    chunk_number: chunk.chunk_number,
                    reason: "parts must be listed in ascending order",
                });
            }
            previous = chunk.chunk_number;

            let (tag, bytes) = upload.parts.get(&chunk.chunk_number).ok_or(Error::InvalidPart {
                chunk_number: chunk.chunk_number,
                reason: "part was never uploaded",
            })?;
            if chunk.e_tag.as_ref() != Some(tag) {
                return Err(Error::InvalidPart {
                    chunk_number: chunk.chunk_number,
                    reason: "etag mismatch",
                });
            }
            let is_last = i + 1 == chunks.len();
            if !is_last && (bytes.len() as u64) < self.min_part_size {
                return Err(Error::InvalidPart {
                    chunk_number: chunk.chunk_number,
                    reason: "part smaller than the minimum part size",
                });
            }
            body.extend_from_slice(bytes);
        }

        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);
        state.objects.insert(
            key.clone(),
            StoredObject {
                content_type,
                body: body.freeze(),
            },
        );
        tracing::debug!(bucket = %self.bucket_name, %key, %upload_id, "completed upload");
        Ok(())
    }

    async fn abort_chunked_upload(&self, upload_id: &str, key: &Key) -> Result<()> {
        let mut state = self.state()?;
        match state.uploads.get(upload_id) {
            Some(u) if &u.key == key => {
                state.uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(Error::UnknownUpload(upload_id.to_string())),
        }
    }

    async fn presign_get(&self, key: &Key, ttl: Duration) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let url = format!("memory://{}/{}?token={}", self.bucket_name, key, token);
        let now = Instant::now();
        let mut state = self.state()?;
        state.urls.retain(|_, issued| issued.expires_at > now);
        state.urls.insert(
            token,
            IssuedUrl {
                key: key.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(url)
    }
}
