use crate::error::{KeywardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level Keyward configuration stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywardConfig {
    pub keyward: CoreSettings,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    /// Key policies ensured to exist at startup.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Directory the storage backend persists key policies under.
    pub storage_path: String,
    /// Disable the shared in-memory policy cache. Each request then loads an
    /// unshared copy from storage and the per-name guard is bypassed.
    #[serde(default)]
    pub cache_disabled: bool,
    /// Backend identity passed to the managed-key custodian.
    #[serde(default = "default_backend_id")]
    pub backend_id: String,
    /// AWS region (for the `aws-custodian` feature).
    #[serde(default)]
    pub aws_region: Option<String>,
    /// Secret name prefix used by the custodian (default: "keyward-key").
    #[serde(default)]
    pub secret_prefix: Option<String>,
}

fn default_backend_id() -> String {
    "keyward".to_string()
}

/// One listener section. Only `type = "tcp"` is built in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(rename = "type", default = "default_listener_type")]
    pub listener_type: String,
    /// Bind address, e.g. "0.0.0.0:8200".
    pub address: String,
    #[serde(default)]
    pub tls_disable: bool,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    /// Minimum accepted TLS version: "tls10", "tls11" or "tls12".
    #[serde(default = "default_tls_min_version")]
    pub tls_min_version: String,
}

fn default_listener_type() -> String {
    "tcp".to_string()
}

/// One `[[keys]]` section: a named key policy created on first startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub name: String,
    /// Key kind: "aes256-gcm", "ml-kem-768" or "managed".
    #[serde(default = "default_key_kind")]
    pub kind: String,
    /// Custodian key name (managed kinds only).
    #[serde(default)]
    pub managed_name: Option<String>,
    /// Custodian key id (managed kinds only).
    #[serde(default)]
    pub managed_id: Option<String>,
}

fn default_key_kind() -> String {
    "aes256-gcm".to_string()
}

fn default_tls_min_version() -> String {
    "tls12".to_string()
}

impl KeywardConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KeywardError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| KeywardError::TomlDe(e.to_string()))
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| KeywardError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config rooted at `base_dir`, with one plaintext listener.
    pub fn default_config(base_dir: &Path) -> Self {
        Self {
            keyward: CoreSettings {
                storage_path: base_dir.join("data").display().to_string(),
                cache_disabled: false,
                backend_id: default_backend_id(),
                aws_region: None,
                secret_prefix: None,
            },
            listeners: vec![ListenerConfig {
                listener_type: default_listener_type(),
                address: "127.0.0.1:8200".to_string(),
                tls_disable: true,
                tls_cert_file: None,
                tls_key_file: None,
                tls_min_version: default_tls_min_version(),
            }],
            keys: vec![],
        }
    }

    /// Resolve the config file path: `<base_dir>/keyward.toml`
    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join("keyward.toml")
    }

    /// Resolve the default keyward home directory: `~/.keyward`
    pub fn default_base_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".keyward"))
            .ok_or_else(|| {
                KeywardError::Configuration("Cannot determine home directory".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keyward.toml");
        let config = KeywardConfig::default_config(tmp.path());
        config.save(&path).unwrap();
        let loaded = KeywardConfig::load(&path).unwrap();
        assert!(!loaded.keyward.cache_disabled);
        assert_eq!(loaded.listeners.len(), 1);
        assert!(loaded.listeners[0].tls_disable);
    }

    #[test]
    fn load_nonexistent_returns_error() {
        let result = KeywardConfig::load(Path::new("/nonexistent/keyward.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn listener_defaults() {
        let toml = r#"
            [keyward]
            storage_path = "/tmp/keyward"

            [[listeners]]
            address = "0.0.0.0:8200"
            tls_cert_file = "server.pem"
            tls_key_file = "server.key"
        "#;
        let config: KeywardConfig = toml::from_str(toml).unwrap();
        let ln = &config.listeners[0];
        assert_eq!(ln.listener_type, "tcp");
        assert!(!ln.tls_disable);
        assert_eq!(ln.tls_min_version, "tls12");
    }

    #[test]
    fn key_sections_parse_with_defaults() {
        let toml = r#"
            [keyward]
            storage_path = "/tmp/keyward"

            [[keys]]
            name = "orders-key"

            [[keys]]
            name = "hsm-key"
            kind = "managed"
            managed_name = "payments-hsm"
        "#;
        let config: KeywardConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].kind, "aes256-gcm");
        assert_eq!(config.keys[1].managed_name.as_deref(), Some("payments-hsm"));
    }

    #[test]
    fn unknown_min_version_is_kept_verbatim() {
        // Validation happens at listener construction, not at parse time.
        let toml = r#"
            [keyward]
            storage_path = "/tmp/keyward"

            [[listeners]]
            address = "0.0.0.0:8200"
            tls_min_version = "tls13"
        "#;
        let config: KeywardConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.listeners[0].tls_min_version, "tls13");
    }
}
