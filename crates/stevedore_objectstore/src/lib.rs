use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

mod config;
pub use config::Config;
mod errors;
pub use errors::{Error, KeyError, Result};
mod memory;
pub use memory::{MemoryConfig, MemoryStore};
pub(crate) mod s3;
pub use s3::S3Config;
pub use s3::S3;

/// The minimum size S3 accepts for every part of a multipart upload except the last.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Acknowledgement returned by the backend for one uploaded part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub e_tag: Option<String>,
    pub chunk_number: i32,
}

/// An object key built from a [`std::path::PathBuf`] that rejects unsavory key names.
///
/// The following rules applied during the [`TryFrom<PathBuf>`] implementation:
///
/// * paths must not start with `/`
/// * paths are delimited by `/`
/// * paths are normalized (`//` are replaced with `/` and never end in `/`)
/// * paths must not contain relative segments (ie `.` or `..`)
/// * path segments must not contain control characters
///
/// Anything else [S3 accepts in a
/// key](https://docs.aws.amazon.com/AmazonS3/latest/userguide/object-keys.html) is kept verbatim,
/// so `My Vacation.mp4` stays `My Vacation.mp4`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    key: String,
}

impl Key {
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl TryFrom<PathBuf> for Key {
    type Error = Error;

    fn try_from(pb: PathBuf) -> Result<Key> {
        let segments = pb
            .components()
            .map(validate_component)
            .collect::<std::result::Result<Vec<_>, KeyError>>()?;
        if segments.is_empty() {
            return Err(KeyError::Empty.into());
        }
        Ok(Key {
            key: segments.join("/"),
        })
    }
}

impl TryFrom<&str> for Key {
    type Error = Error;

    fn try_from(s: &str) -> Result<Key> {
        Key::try_from(PathBuf::from(s))
    }
}

fn validate_component(c: Component<'_>) -> std::result::Result<&str, KeyError> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{Cc}").unwrap());
    match c {
        Component::Prefix(_) => Err(KeyError::PrefixNotAllowed),
        Component::RootDir => Err(KeyError::RootDirNotAllowed),
        Component::CurDir => Err(KeyError::CurDirNotAllowed),
        Component::ParentDir => Err(KeyError::ParentDirNotAllowed),
        Component::Normal(s) => {
            let s = s
                .to_str()
                .ok_or(KeyError::PathComponentsMustBeValidUnicode)?;
            if RE.is_match(s) {
                return Err(KeyError::ControlCharactersNotAllowed(s.to_string()));
            }
            Ok(s)
        }
    }
}

/// Provides a common interface for the multipart upload protocol of different backend object
/// stores.
///
/// Part bodies are read from a file on local disk. Implementations are shared across upload
/// sessions and hold no per-session state beyond what the backend itself tracks.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Smallest size accepted for any part other than the last one.
    fn min_part_size(&self) -> u64;

    async fn initiate_chunked_upload(&self, key: &Key, content_type: &str) -> Result<String>;

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &Key,
        chunk_number: i32,
        path: &Path,
    ) -> Result<Chunk>;

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        key: &Key,
        chunks: Vec<Chunk>,
    ) -> Result<()>;

    async fn abort_chunked_upload(&self, upload_id: &str, key: &Key) -> Result<()>;

    /// Time-limited URL granting read access to the object at `key`.
    async fn presign_get(&self, key: &Key, ttl: Duration) -> Result<String>;
}
