use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::backend::StorageBackend;

/// Filesystem-based storage backend.
///
/// `put` stages the value in a temp file in the same directory and renames it
/// into place; a reader never observes a partially written value.
pub struct LocalBackend {
    base_path: PathBuf,
    name: String,
}

impl LocalBackend {
    pub fn new(base_path: &Path, name: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
            name: name.to_string(),
        })
    }

    fn entry_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let full = self.entry_path(path);
        match std::fs::read(&full) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        let full = self.entry_path(path);
        let parent = full
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid storage path: {path}"))?;
        std::fs::create_dir_all(parent)?;

        // Stage then rename — rename within one directory is atomic.
        let staged = parent.join(format!(".{}.tmp", Uuid::now_v7()));
        std::fs::write(&staged, data)?;
        std::fs::rename(&staged, &full)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path(), "test-local").unwrap();

        let data = b"serialized key policy";
        let path = "keyward/policies/orders-key";

        backend.put(path, data).await.unwrap();
        let fetched = backend.get(path).await.unwrap();
        assert_eq!(fetched.as_deref(), Some(data.as_slice()));
    }

    #[tokio::test]
    async fn missing_path_is_none() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path(), "test-local").unwrap();
        assert!(backend.get("keyward/policies/absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_replaces_previous_value() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path(), "test-local").unwrap();

        backend.put("p", b"old").await.unwrap();
        backend.put("p", b"new").await.unwrap();
        assert_eq!(backend.get("p").await.unwrap().unwrap(), b"new");
    }

    #[tokio::test]
    async fn no_staging_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalBackend::new(tmp.path(), "test-local").unwrap();
        backend.put("keyward/policies/k", b"value").await.unwrap();

        let dir = tmp.path().join("keyward/policies");
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
