use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::errors::CleanupError;

/// Scratch file holding one part body between reading it and handing it to the backend.
///
/// Release it with [`TempResource::release`] to observe cleanup failures. A resource that is
/// dropped instead (for example when an in-flight part upload is cancelled) removes its file
/// synchronously in [`Drop`].
#[derive(Debug)]
pub struct TempResource {
    path: PathBuf,
    released: bool,
    dropped: Arc<AtomicBool>,
}

impl TempResource {
    pub async fn write(dir: &Path, filename: &str, bytes: Bytes) -> std::io::Result<TempResource> {
        let resource = TempResource {
            path: dir.join(format!("{}-{}", Uuid::new_v4(), sanitize(filename))),
            released: false,
            dropped: Arc::new(AtomicBool::new(false)),
        };

        // The blocking write outlives a cancelled caller, so it removes its own file when the
        // resource was dropped before the write finished.
        let path = resource.path.clone();
        let dropped = resource.dropped.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::write(&path, &bytes)?;
            if dropped.load(Ordering::SeqCst) {
                let _ = std::fs::remove_file(&path);
            }
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        Ok(resource)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) -> Result<(), CleanupError> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CleanupError::TempFile {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for TempResource {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => tracing::warn!(path = ?self.path, error = %e, "failed to remove temp file"),
        }
    }
}

fn sanitize(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = TempResource::write(dir.path(), "a/b.bin", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(temp.path()).unwrap(), b"abc");
        assert!(temp
            .path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("-a_b.bin"));

        temp.release().await.unwrap();
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let temp = TempResource::write(dir.path(), "x", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(entries(dir.path()), 1);
        drop(temp);
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(TempResource::write(&missing, "x", Bytes::from_static(b"abc"))
            .await
            .is_err());
    }
}
