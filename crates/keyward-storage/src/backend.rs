use async_trait::async_trait;

/// Trait for durable key-policy storage.
///
/// Single-key atomicity is the whole contract: a `put` is either fully
/// visible to subsequent `get`s or not at all. No multi-key transactions.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the value at a logical path. `None` means the path was never
    /// written — absence is data, not an error.
    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Write the value at a logical path, replacing any previous value.
    async fn put(&self, path: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Backend name for display.
    fn name(&self) -> &str;
}
