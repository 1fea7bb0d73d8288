use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio::sync::Mutex as SessionLock;

use stevedore_objectstore::{Chunk, Key, ObjectStore};

use crate::chunks::ChunkSplitter;
use crate::errors::{CleanupError, Error, FatalUploadError, Result, ValidationError};
use crate::retry::{with_retry, Attempt, RetryPolicy};
use crate::session::{CompletedPart, PartRecord, SessionState, UploadSession, MAX_PART_NUMBER};
use crate::settings::UploadSettings;
use crate::temp::TempResource;

type SessionHandle = Arc<SessionEntry>;

/// An externally-driven session plus one lock per part number.
///
/// Uploads of the same part number run one at a time so that the record kept for a part always
/// belongs to the upload the backend saw last.
struct SessionEntry {
    session: SessionLock<UploadSession>,
    parts: Mutex<HashMap<i32, Arc<SessionLock<()>>>>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> SessionEntry {
        SessionEntry {
            session: SessionLock::new(session),
            parts: Mutex::new(HashMap::new()),
        }
    }

    fn part_lock(&self, part_number: i32) -> Arc<SessionLock<()>> {
        self.parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(part_number)
            .or_default()
            .clone()
    }
}

/// Drives multipart uploads against an [`ObjectStore`].
///
/// Two entry-point shapes share one state machine:
///
/// * [`UploadOrchestrator::run`] (and [`UploadOrchestrator::process_upload`]) takes a whole source
///   and performs initiate, upload every part with retry, then complete.
/// * [`UploadOrchestrator::initiate`], [`UploadOrchestrator::upload_part`] and
///   [`UploadOrchestrator::complete`] let a remote client drive the upload one request at a time.
///   Sessions for this mode live in an in-process registry until they reach a terminal state.
///
/// Every failure that ends a session aborts the multipart upload on the backend (best effort)
/// before the error is returned.
#[derive(Clone)]
pub struct UploadOrchestrator {
    objects: Arc<dyn ObjectStore>,
    settings: UploadSettings,
    retry: RetryPolicy,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl UploadOrchestrator {
    pub fn new(objects: Arc<dyn ObjectStore>, settings: UploadSettings) -> Result<Self> {
        let min = objects.min_part_size();
        if (settings.chunk_size as u64) < min {
            return Err(ValidationError::ChunkSizeTooSmall {
                chunk_size: settings.chunk_size as u64,
                min,
            }
            .into());
        }
        if settings.max_in_flight == 0 {
            return Err(ValidationError::NoPartsInFlight.into());
        }
        Ok(Self {
            objects,
            retry: settings.retry_policy(),
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, upload_id: &str) -> Result<SessionHandle> {
        self.registry()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownUpload(upload_id.to_string()).into())
    }

    fn forget(&self, upload_id: &str) {
        self.registry().remove(upload_id);
    }

    /// Number of externally-driven sessions that have not reached a terminal state.
    pub fn open_sessions(&self) -> usize {
        self.registry().len()
    }

    #[tracing::instrument(skip(self))]
    pub async fn initiate(&self, filename: &str, content_type: &str) -> Result<String> {
        let mut session = UploadSession::new(filename, content_type)?;
        let upload_id = self.initiate_session(&mut session).await?;
        self.registry()
            .insert(upload_id.clone(), Arc::new(SessionEntry::new(session)));
        Ok(upload_id)
    }

    /// Upload one part of an externally-driven session.
    ///
    /// The session lock is only held while checking and recording state, so different parts of
    /// one upload may be sent concurrently. Uploads of the same part number wait for each other.
    /// A part that fails after exhausting its retries aborts the whole session.
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        filename: &str,
        bytes: Bytes,
    ) -> Result<PartRecord> {
        let handle = self.session(upload_id)?;
        let part_lock = handle.part_lock(part_number);
        let _part_guard = part_lock.lock().await;

        let key = {
            let mut session = handle.session.lock().await;
            session.check_filename(filename)?;
            if bytes.is_empty() {
                return Err(ValidationError::EmptyPart(part_number).into());
            }
            let max = self.settings.chunk_size as u64;
            if bytes.len() as u64 > max {
                return Err(ValidationError::PartTooLarge {
                    part_number,
                    size: bytes.len() as u64,
                    max,
                }
                .into());
            }
            session.begin_part(part_number)?;
            session.key().clone()
        };

        match self
            .upload_part_with_retry(upload_id, &key, filename, part_number, bytes)
            .await
        {
            Ok(record) => {
                handle.session.lock().await.record_part(record.clone())?;
                Ok(record)
            }
            Err(e) => {
                let mut session = handle.session.lock().await;
                let e = self.fail(&mut session, Some(part_number), e).await;
                self.forget(upload_id);
                Err(e)
            }
        }
    }

    /// Complete an externally-driven session and return a retrieval URL for the new object.
    ///
    /// An invalid part list is rejected without touching the backend and leaves the session open.
    #[tracing::instrument(skip(self, parts), fields(parts = parts.len()))]
    pub async fn complete(
        &self,
        upload_id: &str,
        filename: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<String> {
        let handle = self.session(upload_id)?;
        let mut session = handle.session.lock().await;
        session.check_filename(filename)?;
        let chunks = session.validate_completion(&parts)?;

        let location = self.finish(&mut session, chunks).await;
        if session.state().is_terminal() {
            self.forget(upload_id);
        }
        location
    }

    /// Cancel an externally-driven session.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        let handle = self.session(upload_id)?;
        let mut session = handle.session.lock().await;
        self.forget(upload_id);
        if !session.state().can_abort() {
            return Err(Error::SessionClosed {
                upload_id: upload_id.to_string(),
                state: session.state(),
            });
        }
        Ok(self.abort_session(&mut session).await?)
    }

    /// Upload a whole in-memory file.
    pub async fn process_upload(
        &self,
        bytes: Bytes,
        filename: &str,
        content_type: &str,
    ) -> Result<String> {
        self.run(std::io::Cursor::new(bytes), filename, content_type)
            .await
    }

    pub async fn run<R>(&self, source: R, filename: &str, content_type: &str) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        self.run_with_signal(source, filename, content_type, std::future::pending())
            .await
    }

    /// Split `source` into parts, upload them and complete the upload.
    ///
    /// When `signal` resolves before every part is uploaded the session is aborted and
    /// [`Error::Cancelled`] is returned inside a [`FatalUploadError`].
    #[tracing::instrument(skip(self, source, signal), fields(upload_id))]
    pub async fn run_with_signal<R, S>(
        &self,
        source: R,
        filename: &str,
        content_type: &str,
        signal: S,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut session = UploadSession::new(filename, content_type)?;

        let chunks = ChunkSplitter::new(source, self.settings.chunk_size).into_stream();
        tokio::pin!(chunks);
        let first = match chunks.try_next().await {
            Ok(Some(first)) => first,
            Ok(None) => return Err(ValidationError::EmptySource.into()),
            Err(e) => return Err(self.fail(&mut session, Some(1), Error::SourceRead(e)).await),
        };

        let upload_id = self.initiate_session(&mut session).await?;
        tracing::Span::current().record("upload_id", upload_id.as_str());

        tokio::pin!(signal);
        let uploaded = tokio::select! {
            r = self.upload_all(&mut session, first, chunks.as_mut()) => r,
            _ = &mut signal => Err((None, Error::Cancelled)),
        };
        if let Err((part_number, e)) = uploaded {
            return Err(self.fail(&mut session, part_number, e).await);
        }

        match session.validate_completion(&session.completed_parts()) {
            Ok(chunks) => self.finish(&mut session, chunks).await,
            Err(e) => Err(self.fail(&mut session, None, e).await),
        }
    }

    async fn upload_all<S>(
        &self,
        session: &mut UploadSession,
        first: Bytes,
        mut chunks: Pin<&mut S>,
    ) -> std::result::Result<(), (Option<i32>, Error)>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        let upload_id = session.upload_id().unwrap_or_default().to_string();
        let key = session.key().clone();
        let filename = session.filename().to_string();

        let mut in_flight = FuturesUnordered::new();
        let mut next = Some(first);
        let mut source_done = false;
        let mut part_number: i32 = 0;

        loop {
            while !source_done && in_flight.len() < self.settings.max_in_flight {
                let bytes = match next.take() {
                    Some(bytes) => bytes,
                    None => match chunks.try_next().await {
                        Ok(Some(bytes)) => bytes,
                        Ok(None) => {
                            source_done = true;
                            break;
                        }
                        Err(e) => return Err((Some(part_number + 1), Error::SourceRead(e))),
                    },
                };
                part_number += 1;
                if part_number > MAX_PART_NUMBER {
                    return Err((
                        Some(part_number),
                        ValidationError::PartNumberOutOfRange(part_number).into(),
                    ));
                }
                session
                    .begin_part(part_number)
                    .map_err(|e| (Some(part_number), e))?;

                let (upload_id, key, filename) = (&upload_id, &key, &filename);
                in_flight.push(async move {
                    let result = self
                        .upload_part_with_retry(upload_id, key, filename, part_number, bytes)
                        .await;
                    (part_number, result)
                });
            }

            match in_flight.next().await {
                None => return Ok(()),
                Some((n, Ok(record))) => session.record_part(record).map_err(|e| (Some(n), e))?,
                Some((n, Err(e))) => return Err((Some(n), e)),
            }
        }
    }

    /// Upload one part, retrying transient transport failures with exponential backoff.
    ///
    /// Every attempt writes the part to its own temp file, which is removed before the attempt
    /// returns.
    pub async fn upload_part_with_retry(
        &self,
        upload_id: &str,
        key: &Key,
        filename: &str,
        part_number: i32,
        bytes: Bytes,
    ) -> Result<PartRecord> {
        let bytes = &bytes;
        with_retry(&self.retry, |attempt| async move {
            tracing::debug!(part_number, attempt, size = bytes.len(), "uploading part");
            self.upload_part_once(upload_id, key, filename, part_number, bytes.clone())
                .await
        })
        .await
    }

    async fn upload_part_once(
        &self,
        upload_id: &str,
        key: &Key,
        filename: &str,
        part_number: i32,
        bytes: Bytes,
    ) -> Attempt<PartRecord> {
        let size_bytes = bytes.len() as u64;
        let temp = match TempResource::write(&self.settings.temp_dir, filename, bytes).await {
            Ok(temp) => temp,
            Err(e) => return Attempt::Fatal(Error::TempWrite(e)),
        };

        let uploaded = self
            .objects
            .upload_chunk(upload_id, key, part_number, temp.path())
            .await;
        let released = temp.release().await;

        match (uploaded, released) {
            (Ok(chunk), Ok(())) => match chunk.e_tag {
                Some(e_tag) => Attempt::Done(PartRecord {
                    part_number,
                    size_bytes,
                    e_tag,
                }),
                None => Attempt::Fatal(Error::MissingETag(part_number)),
            },
            (Ok(_), Err(cleanup)) => Attempt::Fatal(cleanup.into()),
            (Err(e), released) => {
                if let Err(cleanup) = released {
                    tracing::warn!(error = %cleanup, "temp file cleanup failed");
                }
                Err::<PartRecord, _>(Error::from(e)).into()
            }
        }
    }

    async fn initiate_session(&self, session: &mut UploadSession) -> Result<String> {
        let upload_id = self
            .objects
            .initiate_chunked_upload(session.key(), session.content_type())
            .await?;
        session.mark_initiated(&upload_id)?;
        tracing::info!(%upload_id, key = %session.key(), "initiated upload");
        Ok(upload_id)
    }

    async fn finish(&self, session: &mut UploadSession, chunks: Vec<Chunk>) -> Result<String> {
        let upload_id = session.upload_id().unwrap_or_default().to_string();
        let part_count = chunks.len();

        session.transition(SessionState::ReadyToComplete)?;
        if let Err(e) = self
            .objects
            .finalize_chunked_upload(&upload_id, session.key(), chunks)
            .await
        {
            return Err(self.fail(session, None, e.into()).await);
        }
        session.transition(SessionState::Completed)?;
        tracing::info!(%upload_id, parts = part_count, "completed upload");

        Ok(self
            .objects
            .presign_get(session.key(), self.settings.url_ttl())
            .await?)
    }

    async fn abort_session(&self, session: &mut UploadSession) -> std::result::Result<(), CleanupError> {
        let upload_id = session.upload_id().unwrap_or_default().to_string();
        // transitions out of an abortable state cannot fail
        let _ = session.transition(SessionState::Aborting);
        match self
            .objects
            .abort_chunked_upload(&upload_id, session.key())
            .await
        {
            Ok(()) => {
                let _ = session.transition(SessionState::Aborted);
                Ok(())
            }
            Err(source) => {
                let _ = session.transition(SessionState::Failed);
                Err(CleanupError::Abort { upload_id, source })
            }
        }
    }

    /// End the session because of `cause`, aborting it on the backend if it is still open.
    ///
    /// A failing abort is logged; the caller always sees `cause`.
    async fn fail(
        &self,
        session: &mut UploadSession,
        part_number: Option<i32>,
        cause: Error,
    ) -> Error {
        tracing::error!(
            upload_id = ?session.upload_id(),
            filename = session.filename(),
            ?part_number,
            error = %cause,
            "upload failed"
        );
        if session.state().can_abort() {
            if let Err(cleanup) = self.abort_session(session).await {
                tracing::warn!(error = %cleanup, "best effort abort failed");
            }
        }
        if matches!(cause, Error::FatalUpload(_)) {
            return cause;
        }
        Error::FatalUpload(Box::new(FatalUploadError {
            upload_id: session.upload_id().map(str::to_string),
            filename: session.filename().to_string(),
            part_number,
            cause,
        }))
    }
}
