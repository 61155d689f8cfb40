//! The policy store: per-name locking and rotation.
//!
//! Lock handles live in a store-owned map from key name to policy cell, so
//! the policy's data representation stays plain and the locking discipline is
//! swappable independently of it. Read operations (encrypt/decrypt) take the
//! shared side just long enough to copy a snapshot; rotation and
//! configuration updates hold the exclusive side across persist so readers
//! only ever observe a fully committed policy.
//!
//! With [`CacheMode::Disabled`] there is no shared state to protect: every
//! operation loads an unshared copy and the guard is bypassed. Correctness
//! then rests on the storage backend's atomic single-key writes, and
//! overlapping rotations from independent processes are last-write-wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use keyward_core::error::{KeywardError, Result};
use keyward_storage::StorageBackend;

use crate::managed::{ManagedKeyRef, SystemView, resolve_managed_key};
use crate::policy::{KeyKind, KeyPolicy, KeyVersion, VersionMaterial};

/// Whether the store keeps a shared in-memory copy of each policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Shared read-mostly cache guarded by per-name locks.
    Shared,
    /// No cache: every operation loads an unshared copy from storage.
    Disabled,
}

type PolicyCell = Arc<RwLock<KeyPolicy>>;

/// Versioned-key store over a storage backend.
pub struct PolicyStore {
    backend: Arc<dyn StorageBackend>,
    system_view: Arc<dyn SystemView>,
    backend_id: String,
    cache: Option<RwLock<HashMap<String, PolicyCell>>>,
}

impl PolicyStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        system_view: Arc<dyn SystemView>,
        mode: CacheMode,
        backend_id: &str,
    ) -> Self {
        let cache = match mode {
            CacheMode::Shared => Some(RwLock::new(HashMap::new())),
            CacheMode::Disabled => None,
        };
        Self {
            backend,
            system_view,
            backend_id: backend_id.to_string(),
            cache,
        }
    }

    async fn load_required(&self, name: &str) -> Result<KeyPolicy> {
        KeyPolicy::load(&*self.backend, name)
            .await?
            .ok_or_else(|| KeywardError::KeyNotFound(name.to_string()))
    }

    /// Fetch (or populate) the cached cell for a name.
    async fn cell(
        &self,
        cache: &RwLock<HashMap<String, PolicyCell>>,
        name: &str,
    ) -> Result<PolicyCell> {
        {
            let map = cache.read().await;
            if let Some(cell) = map.get(name) {
                return Ok(cell.clone());
            }
        }
        let mut map = cache.write().await;
        if let Some(cell) = map.get(name) {
            return Ok(cell.clone());
        }
        let policy = self.load_required(name).await?;
        let cell = Arc::new(RwLock::new(policy));
        map.insert(name.to_string(), cell.clone());
        Ok(cell)
    }

    /// A consistent copy of the named policy: strictly pre- or post-rotation,
    /// never in between.
    pub async fn snapshot(&self, name: &str) -> Result<KeyPolicy> {
        match &self.cache {
            Some(cache) => {
                let cell = self.cell(cache, name).await?;
                let guard = cell.read().await;
                Ok(guard.clone())
            }
            None => self.load_required(name).await,
        }
    }

    /// Create the named policy if it does not exist yet. Creating an existing
    /// policy is a no-op; the stored policy is returned untouched either way.
    pub async fn create(
        &self,
        name: &str,
        kind: KeyKind,
        managed_ref: Option<&ManagedKeyRef>,
    ) -> Result<KeyPolicy> {
        match &self.cache {
            Some(cache) => {
                // Hold the map exclusively so concurrent creates of one name
                // cannot both persist a first version.
                let mut map = cache.write().await;
                if let Some(cell) = map.get(name) {
                    return Ok(cell.read().await.clone());
                }
                if let Some(existing) = KeyPolicy::load(&*self.backend, name).await? {
                    map.insert(name.to_string(), Arc::new(RwLock::new(existing.clone())));
                    return Ok(existing);
                }
                let policy = self.build_policy(name, kind, managed_ref).await?;
                policy.persist(&*self.backend).await?;
                map.insert(name.to_string(), Arc::new(RwLock::new(policy.clone())));
                tracing::info!(name = %name, kind = %kind, "Created key policy");
                Ok(policy)
            }
            None => {
                if let Some(existing) = KeyPolicy::load(&*self.backend, name).await? {
                    return Ok(existing);
                }
                let policy = self.build_policy(name, kind, managed_ref).await?;
                policy.persist(&*self.backend).await?;
                tracing::info!(name = %name, kind = %kind, "Created key policy");
                Ok(policy)
            }
        }
    }

    async fn build_policy(
        &self,
        name: &str,
        kind: KeyKind,
        managed_ref: Option<&ManagedKeyRef>,
    ) -> Result<KeyPolicy> {
        let (material, managed_key_id) = match kind {
            KeyKind::Managed => {
                let key_id = self.resolve_reference(managed_ref).await?;
                (
                    VersionMaterial::Managed {
                        key_id: key_id.clone(),
                    },
                    Some(key_id),
                )
            }
            kind => (kind.generate_material()?, None),
        };
        Ok(KeyPolicy::new(name, kind, material, managed_key_id))
    }

    async fn resolve_reference(&self, managed_ref: Option<&ManagedKeyRef>) -> Result<String> {
        let reference = managed_ref.ok_or_else(|| {
            KeywardError::InvalidRequest(
                "A managed key requires a custodian key name or id".to_string(),
            )
        })?;
        resolve_managed_key(&*self.system_view, &self.backend_id, reference).await
    }

    /// Rotate the named policy: append one new version and commit it.
    ///
    /// The decryption/encryption floors are left untouched. Any failure
    /// before or during persist leaves storage and the shared copy at the
    /// pre-rotation state; the caller may safely retry.
    pub async fn rotate(&self, name: &str, managed_ref: Option<&ManagedKeyRef>) -> Result<()> {
        match &self.cache {
            Some(cache) => {
                let cell = self.cell(cache, name).await?;
                let mut guard = cell.write().await;
                let updated = self.rotated(&guard, managed_ref).await?;
                *guard = updated;
            }
            None => {
                tracing::debug!(
                    name = %name,
                    "Rotating without a shared cache; overlapping rotations are last-write-wins"
                );
                let policy = self.load_required(name).await?;
                self.rotated(&policy, managed_ref).await?;
            }
        }
        Ok(())
    }

    /// Produce and persist the rotated successor of `policy`. The input is
    /// only replaced by the caller after persist succeeds.
    async fn rotated(
        &self,
        policy: &KeyPolicy,
        managed_ref: Option<&ManagedKeyRef>,
    ) -> Result<KeyPolicy> {
        let material = match policy.kind {
            KeyKind::Managed => {
                let key_id = self.resolve_reference(managed_ref).await?;
                VersionMaterial::Managed { key_id }
            }
            kind => kind.generate_material()?,
        };
        let version = KeyVersion {
            version: policy.latest_version + 1,
            created_at: Utc::now(),
            material,
        };
        let updated = policy.append_version(version)?;
        updated.persist(&*self.backend).await?;
        tracing::info!(
            name = %updated.name,
            version = updated.latest_version,
            "Rotated key policy"
        );
        Ok(updated)
    }

    /// Encrypt under the named policy's active encryption version.
    pub async fn encrypt(&self, name: &str, plaintext: &[u8]) -> Result<String> {
        // Snapshot under the shared lock; all cryptographic work happens on
        // the copy, outside any lock.
        let policy = self.snapshot(name).await?;
        policy.encrypt(plaintext)
    }

    /// Decrypt a ciphertext envelope against the named policy.
    pub async fn decrypt(&self, name: &str, ciphertext: &str) -> Result<Vec<u8>> {
        let policy = self.snapshot(name).await?;
        policy.decrypt(ciphertext)
    }

    /// Administrative update of the version floors. Rotation never touches
    /// these; this is the only path that does.
    pub async fn update_config(
        &self,
        name: &str,
        min_decryption_version: Option<u32>,
        min_encryption_version: Option<u32>,
    ) -> Result<()> {
        match &self.cache {
            Some(cache) => {
                let cell = self.cell(cache, name).await?;
                let mut guard = cell.write().await;
                let updated =
                    self.reconfigured(&guard, min_decryption_version, min_encryption_version)?;
                updated.persist(&*self.backend).await?;
                *guard = updated;
            }
            None => {
                let policy = self.load_required(name).await?;
                let updated =
                    self.reconfigured(&policy, min_decryption_version, min_encryption_version)?;
                updated.persist(&*self.backend).await?;
            }
        }
        Ok(())
    }

    fn reconfigured(
        &self,
        policy: &KeyPolicy,
        min_decryption_version: Option<u32>,
        min_encryption_version: Option<u32>,
    ) -> Result<KeyPolicy> {
        let mut updated = policy.clone();
        if let Some(min_dec) = min_decryption_version {
            if min_dec < 1 || min_dec > policy.latest_version {
                return Err(KeywardError::InvalidRequest(format!(
                    "min_decryption_version {min_dec} must be between 1 and {}",
                    policy.latest_version
                )));
            }
            if min_dec < policy.min_decryption_version {
                return Err(KeywardError::InvalidRequest(format!(
                    "min_decryption_version cannot be lowered from {}",
                    policy.min_decryption_version
                )));
            }
            updated.min_decryption_version = min_dec;
        }
        if let Some(min_enc) = min_encryption_version {
            if min_enc != 0
                && (min_enc < updated.min_decryption_version || min_enc > policy.latest_version)
            {
                return Err(KeywardError::InvalidRequest(format!(
                    "min_encryption_version {min_enc} must be 0 or between {} and {}",
                    updated.min_decryption_version, policy.latest_version
                )));
            }
            updated.min_encryption_version = min_enc;
        }
        Ok(updated)
    }
}
