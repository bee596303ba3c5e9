use std::collections::HashMap;
use std::sync::RwLock;

use crate::{Store, StoreFuture};

/// Volatile in-memory store. All entries are lost on process exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Returns `true` when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemoryStore {
    fn set<'a>(&'a self, fingerprint: &'a str, url: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries
                .write()
                .unwrap()
                .insert(fingerprint.to_string(), url.to_string());
            Ok(())
        })
    }

    fn get<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.read().unwrap().get(fingerprint).cloned()) })
    }

    fn remove<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.write().unwrap().remove(fingerprint);
            Ok(())
        })
    }
}
