//! Multipart upload orchestration.
//!
//! Splits a source into fixed-size parts, uploads them to an
//! [`ObjectStore`](stevedore_objectstore::ObjectStore) with bounded retry, and either completes
//! the upload or aborts it so that no partial state is left behind.

mod chunks;
pub use chunks::{part_count, ChunkSplitter};

pub mod errors;
pub use errors::{CleanupError, Error, FatalUploadError, Result, ValidationError};

mod orchestrator;
pub use orchestrator::UploadOrchestrator;

mod retry;
pub use retry::{with_retry, Attempt, RetryPolicy};

mod session;
pub use session::{CompletedPart, PartRecord, SessionState, UploadSession, MAX_PART_NUMBER};

mod settings;
pub use settings::{UploadSettings, DEFAULT_CHUNK_SIZE};

mod temp;
pub use temp::TempResource;
