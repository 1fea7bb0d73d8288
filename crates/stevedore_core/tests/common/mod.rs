#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;

use stevedore_core::{UploadOrchestrator, UploadSettings};
use stevedore_objectstore::{Chunk, Error, Key, MemoryStore, ObjectStore, Result};

pub const PART: usize = 16;

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    Transient,
    Permanent,
}

impl Fault {
    fn into_error(self, chunk_number: i32) -> Error {
        match self {
            Fault::Transient => Error::Unavailable(String::from("injected")),
            Fault::Permanent => Error::InvalidPart {
                chunk_number,
                reason: "injected",
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadCall {
    pub chunk_number: i32,
    pub size: u64,
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    initiate: Option<Fault>,
    uploads: HashMap<i32, VecDeque<Fault>>,
    finalize: Option<Fault>,
    abort: Option<Fault>,
    presign: Option<Fault>,
    /// Parts whose scratch file is swapped for a directory once the backend has read it.
    unremovable: Vec<i32>,
}

#[derive(Clone, Debug, Default)]
pub struct Calls {
    pub initiate: u32,
    pub uploads: Vec<UploadCall>,
    pub finalize: u32,
    pub abort: u32,
    pub presign: u32,
    /// Order in which the protocol calls happened, by name.
    pub log: Vec<&'static str>,
}

impl Calls {
    pub fn uploads_of(&self, chunk_number: i32) -> Vec<&UploadCall> {
        self.uploads
            .iter()
            .filter(|c| c.chunk_number == chunk_number)
            .collect()
    }
}

/// [`MemoryStore`] wrapper that records every call and fails the ones it is told to.
pub struct FlakyStore {
    pub inner: MemoryStore,
    script: Mutex<Script>,
    calls: Mutex<Calls>,
}

impl FlakyStore {
    pub fn new(min_part_size: u64) -> Self {
        Self {
            inner: MemoryStore::new("test", min_part_size),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn fail_initiate(&self, fault: Fault) {
        self.script.lock().unwrap().initiate = Some(fault);
    }

    pub fn fail_upload(&self, chunk_number: i32, faults: &[Fault]) {
        self.script
            .lock()
            .unwrap()
            .uploads
            .entry(chunk_number)
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn fail_finalize(&self, fault: Fault) {
        self.script.lock().unwrap().finalize = Some(fault);
    }

    pub fn fail_abort(&self, fault: Fault) {
        self.script.lock().unwrap().abort = Some(fault);
    }

    pub fn fail_presign(&self, fault: Fault) {
        self.script.lock().unwrap().presign = Some(fault);
    }

    /// Make the scratch file of `chunk_number` impossible to remove after a successful upload.
    pub fn block_cleanup(&self, chunk_number: i32) {
        self.script.lock().unwrap().unremovable.push(chunk_number);
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size()
    }

    async fn initiate_chunked_upload(&self, key: &Key, content_type: &str) -> Result<String> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.initiate += 1;
            calls.log.push("initiate");
        }
        let fault = self.script.lock().unwrap().initiate;
        if let Some(fault) = fault {
            return Err(fault.into_error(0));
        }
        self.inner.initiate_chunked_upload(key, content_type).await
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        key: &Key,
        chunk_number: i32,
        path: &Path,
    ) -> Result<Chunk> {
        let size = tokio::fs::metadata(path).await?.len();
        {
            let mut calls = self.calls.lock().unwrap();
            calls.uploads.push(UploadCall {
                chunk_number,
                size,
                at: Instant::now(),
            });
            calls.log.push("upload");
        }
        let fault = self
            .script
            .lock()
            .unwrap()
            .uploads
            .get_mut(&chunk_number)
            .and_then(|faults| faults.pop_front());
        if let Some(fault) = fault {
            return Err(fault.into_error(chunk_number));
        }
        let chunk = self
            .inner
            .upload_chunk(upload_id, key, chunk_number, path)
            .await?;

        let block = self.script.lock().unwrap().unremovable.contains(&chunk_number);
        if block {
            std::fs::remove_file(path)?;
            std::fs::create_dir(path)?;
        }
        Ok(chunk)
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        key: &Key,
        chunks: Vec<Chunk>,
    ) -> Result<()> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.finalize += 1;
            calls.log.push("finalize");
        }
        let fault = self.script.lock().unwrap().finalize;
        if let Some(fault) = fault {
            return Err(fault.into_error(0));
        }
        self.inner
            .finalize_chunked_upload(upload_id, key, chunks)
            .await
    }

    async fn abort_chunked_upload(&self, upload_id: &str, key: &Key) -> Result<()> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.abort += 1;
            calls.log.push("abort");
        }
        let fault = self.script.lock().unwrap().abort;
        // the backend still drops the upload when the abort response is lost
        let aborted = self.inner.abort_chunked_upload(upload_id, key).await;
        match fault {
            Some(fault) => Err(fault.into_error(0)),
            None => aborted,
        }
    }

    async fn presign_get(&self, key: &Key, ttl: Duration) -> Result<String> {
        {
            let mut calls = self.calls.lock().unwrap();
            calls.presign += 1;
            calls.log.push("presign");
        }
        let fault = self.script.lock().unwrap().presign;
        if let Some(fault) = fault {
            return Err(fault.into_error(0));
        }
        self.inner.presign_get(key, ttl).await
    }
}

pub struct Harness {
    pub orchestrator: UploadOrchestrator,
    pub store: Arc<FlakyStore>,
    pub temp_dir: TempDir,
}

impl Harness {
    pub fn new(part_size: usize, configure: impl FnOnce(&mut UploadSettings)) -> Harness {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(part_size as u64));
        let mut settings = UploadSettings {
            chunk_size: part_size,
            temp_dir: temp_dir.path().to_path_buf(),
            ..UploadSettings::default()
        };
        configure(&mut settings);
        let orchestrator = UploadOrchestrator::new(store.clone(), settings).unwrap();
        Harness {
            orchestrator,
            store,
            temp_dir,
        }
    }

    pub fn small() -> Harness {
        Harness::new(PART, |_| ())
    }

    /// Number of files left behind in the scratch directory.
    pub fn leftover_temp_files(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path()).unwrap().count()
    }
}

pub fn source(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}
