use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::StorageBackend;

/// In-memory storage backend for tests and single-process embedding.
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_next_put: AtomicBool,
    name: String,
}

impl MemoryBackend {
    pub fn new(name: &str) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail_next_put: AtomicBool::new(false),
            name: name.to_string(),
        }
    }

    /// Make the next `put` fail. Used by rotation-failure tests to verify
    /// that a failed persist leaves no partial state behind.
    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().expect("storage map poisoned");
        Ok(entries.get(path).cloned())
    }

    async fn put(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected put failure");
        }
        let mut entries = self.entries.lock().expect("storage map poisoned");
        entries.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let backend = MemoryBackend::default();
        backend.put("a/b", b"value").await.unwrap();
        assert_eq!(backend.get("a/b").await.unwrap().unwrap(), b"value");
        assert!(backend.get("a/c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let backend = MemoryBackend::default();
        backend.fail_next_put();
        assert!(backend.put("a", b"x").await.is_err());
        backend.put("a", b"x").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().unwrap(), b"x");
    }
}
