use std::path::PathBuf;

use thiserror;

use stevedore_objectstore::Error as ObjectStoreError;

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("transient transport error: {0}")]
    TransientTransport(#[source] ObjectStoreError),
    #[error("permanent transport error: {0}")]
    PermanentTransport(#[source] ObjectStoreError),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },
    #[error("transport acknowledged part {0} without an etag")]
    MissingETag(i32),

    #[error(transparent)]
    FatalUpload(Box<FatalUploadError>),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("failed to read upload source: {0}")]
    SourceRead(#[source] std::io::Error),
    #[error("failed to write temp file: {0}")]
    TempWrite(#[source] std::io::Error),

    #[error("upload cancelled")]
    Cancelled,
    #[error("upload session {upload_id} is {state:?}")]
    SessionClosed {
        upload_id: String,
        state: SessionState,
    },
    #[error("illegal session transition from {from:?} to {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

impl From<ObjectStoreError> for Error {
    fn from(e: ObjectStoreError) -> Error {
        if e.is_transient() {
            Error::TransientTransport(e)
        } else {
            Error::PermanentTransport(e)
        }
    }
}

impl Error {
    /// The failing part number, when the error ended a session during a part upload.
    pub fn part_number(&self) -> Option<i32> {
        match self {
            Error::FatalUpload(f) => f.part_number,
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

/// Malformed input, rejected before any transport call is made.
#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("refusing to upload an empty source")]
    EmptySource,
    #[error("invalid filename {filename:?}: {source}")]
    InvalidFilename {
        filename: String,
        source: ObjectStoreError,
    },
    #[error("chunk size {chunk_size} is below the backend minimum part size {min}")]
    ChunkSizeTooSmall { chunk_size: u64, min: u64 },
    #[error("at least one part upload must be allowed in flight")]
    NoPartsInFlight,
    #[error("unknown upload: {0}")]
    UnknownUpload(String),
    #[error("upload {upload_id} is for {expected:?}, not {found:?}")]
    FilenameMismatch {
        upload_id: String,
        expected: String,
        found: String,
    },
    #[error("part number {0} is outside 1..=10000")]
    PartNumberOutOfRange(i32),
    #[error("part {0} is empty")]
    EmptyPart(i32),
    #[error("part {part_number} is {size} bytes, larger than the {max} byte chunk size")]
    PartTooLarge {
        part_number: i32,
        size: u64,
        max: u64,
    },
    #[error("no parts to complete")]
    NoParts,
    #[error("part list is not contiguous: expected part {expected}, found {found}")]
    NonContiguousParts { expected: i32, found: i32 },
    #[error("part {0} listed more than once")]
    DuplicatePart(i32),
    #[error("part {0} was uploaded but is missing from the part list")]
    MissingPart(i32),
    #[error("part {0} was never uploaded")]
    UnknownPart(i32),
    #[error("etag for part {0} does not match the uploaded part")]
    ETagMismatch(i32),
}

/// Failure to release something the orchestrator acquired.
#[derive(thiserror::Error, Debug)]
pub enum CleanupError {
    #[error("failed to remove temp file {path:?}: {source}")]
    TempFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to abort upload {upload_id}: {source}")]
    Abort {
        upload_id: String,
        source: ObjectStoreError,
    },
}

/// The single terminal error a caller sees for a session that did not complete.
///
/// Carries enough context to restart the whole upload; sessions are never left resumable.
#[derive(Debug)]
pub struct FatalUploadError {
    pub upload_id: Option<String>,
    pub filename: String,
    pub part_number: Option<i32>,
    pub cause: Error,
}

impl std::fmt::Display for FatalUploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "upload of {}", self.filename)?;
        if let Some(upload_id) = &self.upload_id {
            write!(f, " ({upload_id})")?;
        }
        write!(f, " failed")?;
        if let Some(part_number) = self.part_number {
            write!(f, " at part {part_number}")?;
        }
        write!(f, ": {}", self.cause)
    }
}

impl std::error::Error for FatalUploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}
