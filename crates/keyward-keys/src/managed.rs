//! Managed-key resolution.
//!
//! A managed key's material is owned by an external custodian; the policy
//! stores only a canonical key id. The custodian is reached through the
//! system view's optional managed-key capability — callers check for the
//! capability explicitly instead of downcasting.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use keyward_core::error::{KeywardError, Result};

/// Caller-supplied reference to a custodian key: a name, an id, or both.
#[derive(Debug, Clone, Default)]
pub struct ManagedKeyRef {
    pub name: Option<String>,
    pub id: Option<String>,
}

impl ManagedKeyRef {
    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            id: None,
        }
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            name: None,
            id: Some(id.to_string()),
        }
    }
}

/// The custodian side of managed keys.
#[async_trait]
pub trait ManagedKeySystemView: Send + Sync {
    /// Resolve a custodian key reference to its canonical key id.
    ///
    /// Resolution is side-effect-free. When both name and id are given they
    /// must identify the same key.
    async fn resolve_managed_key_id(
        &self,
        backend_id: &str,
        name: Option<&str>,
        id: Option<&str>,
    ) -> Result<String>;
}

/// Capabilities the hosting system exposes to the key store.
pub trait SystemView: Send + Sync {
    /// The managed-key capability, when the host provides one.
    fn managed_key_view(&self) -> Option<&dyn ManagedKeySystemView> {
        None
    }
}

/// Resolve a managed-key reference through the system view.
pub async fn resolve_managed_key(
    view: &dyn SystemView,
    backend_id: &str,
    reference: &ManagedKeyRef,
) -> Result<String> {
    if reference.name.is_none() && reference.id.is_none() {
        return Err(KeywardError::InvalidRequest(
            "Either the managed key name or id must be provided".to_string(),
        ));
    }
    let Some(custodian) = view.managed_key_view() else {
        return Err(KeywardError::Unsupported(
            "System view does not support managed keys".to_string(),
        ));
    };
    custodian
        .resolve_managed_key_id(
            backend_id,
            reference.name.as_deref(),
            reference.id.as_deref(),
        )
        .await
}

/// System view assembled at startup from whatever capabilities the host has.
pub struct StaticSystemView {
    managed: Option<Arc<dyn ManagedKeySystemView>>,
}

impl StaticSystemView {
    pub fn new(managed: Option<Arc<dyn ManagedKeySystemView>>) -> Self {
        Self { managed }
    }

    /// A view with no optional capabilities.
    pub fn bare() -> Self {
        Self { managed: None }
    }
}

impl SystemView for StaticSystemView {
    fn managed_key_view(&self) -> Option<&dyn ManagedKeySystemView> {
        self.managed.as_deref()
    }
}

/// In-process custodian backed by a name → key-id table. Useful for tests
/// and single-process embedding without a cloud custodian.
pub struct MemoryCustodian {
    keys: HashMap<String, String>,
}

impl MemoryCustodian {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn register(mut self, name: &str, key_id: &str) -> Self {
        self.keys.insert(name.to_string(), key_id.to_string());
        self
    }
}

impl Default for MemoryCustodian {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedKeySystemView for MemoryCustodian {
    async fn resolve_managed_key_id(
        &self,
        _backend_id: &str,
        name: Option<&str>,
        id: Option<&str>,
    ) -> Result<String> {
        match (name, id) {
            (Some(name), None) => self
                .keys
                .get(name)
                .cloned()
                .ok_or_else(|| KeywardError::ManagedKeyNotFound(name.to_string())),
            (None, Some(id)) => self
                .keys
                .values()
                .find(|v| v.as_str() == id)
                .cloned()
                .ok_or_else(|| KeywardError::ManagedKeyNotFound(id.to_string())),
            (Some(name), Some(id)) => {
                let resolved = self
                    .keys
                    .get(name)
                    .cloned()
                    .ok_or_else(|| KeywardError::ManagedKeyNotFound(name.to_string()))?;
                if resolved != id {
                    return Err(KeywardError::InvalidRequest(format!(
                        "Managed key name {name} and id {id} identify different keys"
                    )));
                }
                Ok(resolved)
            }
            (None, None) => Err(KeywardError::InvalidRequest(
                "Either the managed key name or id must be provided".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with_keys() -> StaticSystemView {
        let custodian = MemoryCustodian::new().register("payments-hsm", "uuid-1234");
        StaticSystemView::new(Some(Arc::new(custodian)))
    }

    #[tokio::test]
    async fn resolves_by_name() {
        let view = view_with_keys();
        let id = resolve_managed_key(&view, "backend-a", &ManagedKeyRef::by_name("payments-hsm"))
            .await
            .unwrap();
        assert_eq!(id, "uuid-1234");
    }

    #[tokio::test]
    async fn resolves_by_id() {
        let view = view_with_keys();
        let id = resolve_managed_key(&view, "backend-a", &ManagedKeyRef::by_id("uuid-1234"))
            .await
            .unwrap();
        assert_eq!(id, "uuid-1234");
    }

    #[tokio::test]
    async fn missing_capability_is_unsupported() {
        let view = StaticSystemView::bare();
        let result =
            resolve_managed_key(&view, "backend-a", &ManagedKeyRef::by_name("payments-hsm")).await;
        assert!(matches!(result, Err(KeywardError::Unsupported(_))));
    }

    #[tokio::test]
    async fn empty_reference_is_invalid() {
        let view = view_with_keys();
        let result = resolve_managed_key(&view, "backend-a", &ManagedKeyRef::default()).await;
        assert!(matches!(result, Err(KeywardError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let view = view_with_keys();
        let result =
            resolve_managed_key(&view, "backend-a", &ManagedKeyRef::by_name("missing")).await;
        assert!(matches!(result, Err(KeywardError::ManagedKeyNotFound(_))));
    }

    #[tokio::test]
    async fn inconsistent_name_and_id_pair_is_invalid() {
        let view = view_with_keys();
        let reference = ManagedKeyRef {
            name: Some("payments-hsm".to_string()),
            id: Some("uuid-9999".to_string()),
        };
        let result = resolve_managed_key(&view, "backend-a", &reference).await;
        assert!(matches!(result, Err(KeywardError::InvalidRequest(_))));
    }
}
