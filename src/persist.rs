//! Remembered roots.
//!
//! A [`RootStore`] keeps root handles across sessions so a host can offer
//! previously granted directories again. The mirror only writes to it when a
//! root is opened.

use crate::store::DirRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;

/// Key → root handle storage.
#[async_trait]
pub trait RootStore: Send + Sync {
    /// Every remembered root, ordered by key.
    async fn get_all(&self) -> io::Result<Vec<(String, DirRef)>>;

    /// Remember `handle` under `key`, replacing any previous handle.
    async fn save(&self, key: &str, handle: DirRef) -> io::Result<()>;

    /// Forget `key`.
    async fn remove(&self, key: &str) -> io::Result<()>;

    /// Forget everything.
    async fn clear(&self) -> io::Result<()>;
}

/// Process-local [`RootStore`].
#[derive(Debug, Default)]
pub struct MemoryRootStore {
    roots: Mutex<HashMap<String, DirRef>>,
}

impl MemoryRootStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RootStore for MemoryRootStore {
    async fn get_all(&self) -> io::Result<Vec<(String, DirRef)>> {
        let mut roots: Vec<(String, DirRef)> = self
            .roots
            .lock()
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();
        roots.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(roots)
    }

    async fn save(&self, key: &str, handle: DirRef) -> io::Result<()> {
        self.roots.lock().insert(key.to_string(), handle);
        Ok(())
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        self.roots.lock().remove(key);
        Ok(())
    }

    async fn clear(&self) -> io::Result<()> {
        self.roots.lock().clear();
        Ok(())
    }
}
