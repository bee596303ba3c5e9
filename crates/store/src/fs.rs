use std::io::ErrorKind;
use std::path::PathBuf;

use crate::{Store, StoreError, StoreFuture};

/// Filesystem-backed store: one file per fingerprint.
///
/// Each fingerprint maps to a file named after it inside `dir`; the file's
/// sole content is the upload URL as UTF-8 text. `set` writes a temporary
/// sibling and renames it into place so concurrent readers never observe a
/// partial write.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Directory holding the entries.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(fingerprint)
    }
}

impl Store for FsStore {
    fn set<'a>(&'a self, fingerprint: &'a str, url: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let tmp = self.dir.join(format!(".{fingerprint}.tmp"));
            tokio::fs::write(&tmp, url.as_bytes()).await?;
            tokio::fs::rename(&tmp, self.entry_path(fingerprint)).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(self.entry_path(fingerprint)).await {
                Ok(url) => Ok(Some(url)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn remove<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.entry_path(fingerprint)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
