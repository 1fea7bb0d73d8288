use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stevedore_objectstore::{Chunk, Key};

use crate::errors::{Error, Result, ValidationError};

/// Highest part number the multipart protocol accepts.
pub const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Initiated,
    UploadingParts,
    ReadyToComplete,
    Completed,
    Aborting,
    Aborted,
    /// The session was being aborted and the abort call itself failed.
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }

    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            SessionState::Initiated | SessionState::UploadingParts | SessionState::ReadyToComplete
        )
    }

    fn allows(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Initiated) => true,
            (Initiated, UploadingParts) => true,
            (UploadingParts, ReadyToComplete) => true,
            (ReadyToComplete, Completed) => true,
            (s, Aborting) => s.can_abort(),
            (Aborting, Aborted) | (Aborting, Failed) => true,
            _ => false,
        }
    }
}

/// One acknowledged part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: i32,
    pub size_bytes: u64,
    pub e_tag: String,
}

/// A part as listed by a caller asking to complete an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

impl From<&PartRecord> for CompletedPart {
    fn from(p: &PartRecord) -> CompletedPart {
        CompletedPart {
            part_number: p.part_number,
            e_tag: p.e_tag.clone(),
        }
    }
}

/// In-memory state of one multipart upload.
///
/// Only the orchestrator driving the upload mutates it and it never outlives the upload.
#[derive(Debug)]
pub struct UploadSession {
    key: Key,
    filename: String,
    content_type: String,
    upload_id: Option<String>,
    parts: BTreeMap<i32, PartRecord>,
    state: SessionState,
}

impl UploadSession {
    pub fn new(filename: &str, content_type: &str) -> Result<UploadSession> {
        let key = Key::try_from(filename).map_err(|source| ValidationError::InvalidFilename {
            filename: filename.to_string(),
            source,
        })?;
        Ok(UploadSession {
            key,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            upload_id: None,
            parts: BTreeMap::new(),
            state: SessionState::Created,
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.allows(next) {
            return Err(Error::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(upload_id = ?self.upload_id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        Ok(())
    }

    pub fn mark_initiated(&mut self, upload_id: &str) -> Result<()> {
        self.transition(SessionState::Initiated)?;
        self.upload_id = Some(upload_id.to_string());
        Ok(())
    }

    pub fn check_filename(&self, filename: &str) -> Result<()> {
        if filename != self.filename {
            return Err(ValidationError::FilenameMismatch {
                upload_id: self.upload_id.clone().unwrap_or_default(),
                expected: self.filename.clone(),
                found: filename.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Initiated | SessionState::UploadingParts => Ok(()),
            state => Err(Error::SessionClosed {
                upload_id: self.upload_id.clone().unwrap_or_default(),
                state,
            }),
        }
    }

    /// Check that `part_number` may be uploaded now, moving the session into `UploadingParts`.
    pub fn begin_part(&mut self, part_number: i32) -> Result<()> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(ValidationError::PartNumberOutOfRange(part_number).into());
        }
        self.ensure_open()?;
        if self.state == SessionState::Initiated {
            self.transition(SessionState::UploadingParts)?;
        }
        Ok(())
    }

    /// Record an acknowledged part. A part number uploaded twice keeps only the latest record.
    pub fn record_part(&mut self, part: PartRecord) -> Result<()> {
        self.ensure_open()?;
        self.parts.insert(part.part_number, part);
        Ok(())
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartRecord> {
        self.parts.values()
    }

    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts.values().map(CompletedPart::from).collect()
    }

    /// Validate a caller's part list against the parts this session recorded.
    ///
    /// Part numbers must form exactly `1..=N`, every recorded part must be listed, and every listed
    /// part must carry the ETag the backend returned for it. On success the parts are returned in
    /// ascending order, ready for the backend.
    pub fn validate_completion(&self, parts: &[CompletedPart]) -> Result<Vec<Chunk>> {
        if parts.is_empty() {
            return Err(ValidationError::NoParts.into());
        }

        let mut sorted: Vec<&CompletedPart> = parts.iter().collect();
        sorted.sort_by_key(|p| p.part_number);

        let mut previous = 0;
        for part in sorted.iter() {
            if part.part_number == previous {
                return Err(ValidationError::DuplicatePart(part.part_number).into());
            }
            if part.part_number != previous + 1 {
                return Err(ValidationError::NonContiguousParts {
                    expected: previous + 1,
                    found: part.part_number,
                }
                .into());
            }
            previous = part.part_number;
        }

        if let Some(missing) = self.parts.keys().find(|n| **n > previous) {
            return Err(ValidationError::MissingPart(*missing).into());
        }

        sorted
            .into_iter()
            .map(|part| match self.parts.get(&part.part_number) {
                None => Err(ValidationError::UnknownPart(part.part_number).into()),
                Some(recorded) if recorded.e_tag != part.e_tag => {
                    Err(ValidationError::ETagMismatch(part.part_number).into())
                }
                Some(recorded) => Ok(Chunk {
                    e_tag: Some(recorded.e_tag.clone()),
                    chunk_number: recorded.part_number,
                }),
            })
            .collect()
    }
}
