use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::{Store, StoreError, StoreFuture};

/// Single-file JSON store: one named database holding one object keyed by
/// fingerprint.
///
/// Entries are cached in memory and every mutation rewrites the file through
/// a temporary sibling and a rename, so a crash mid-write never corrupts the
/// database. Writers are serialized by an internal lock.
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl KvStore {
    /// Default database file name.
    pub const DEFAULT_NAME: &'static str = "tuskit-uploads.json";

    /// Opens (or creates) the database at `path`, loading existing entries.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl Store for KvStore {
    fn set<'a>(&'a self, fingerprint: &'a str, url: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(fingerprint.to_string(), url.to_string());
            self.persist(&entries).await
        })
    }

    fn get<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(fingerprint).cloned()) })
    }

    fn remove<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if entries.remove(fingerprint).is_none() {
                return Ok(());
            }
            self.persist(&entries).await
        })
    }
}
