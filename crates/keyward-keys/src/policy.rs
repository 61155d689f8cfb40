//! Versioned key policies.
//!
//! A [`KeyPolicy`] is the full rotation history of one named key: every
//! generation of material ever produced for it, the floor below which
//! decryption is refused, and an optional pin forcing new encryptions onto a
//! version other than the latest. Versions are immutable once created;
//! rotation only ever appends.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use keyward_core::crypto;
use keyward_core::error::{KeywardError, Result};
use keyward_storage::StorageBackend;

type Ek768 = <MlKem768 as KemCore>::EncapsulationKey;
type Dk768 = <MlKem768 as KemCore>::DecapsulationKey;
type Ek768Size = <Ek768 as EncodedSizeUser>::EncodedSize;
type Dk768Size = <Dk768 as EncodedSizeUser>::EncodedSize;

/// ML-KEM-768 ciphertext length prepended to key-pair payloads.
const KEM_CT_LEN: usize = 1088;

/// Ciphertext envelope prefix: `kw:v{version}:{base64}`.
const CIPHERTEXT_PREFIX: &str = "kw:v";

/// The algorithm a named key runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    /// 256-bit symmetric key, AES-256-GCM payloads.
    Aes256Gcm,
    /// ML-KEM-768 key pair; payloads are encapsulated then AEAD-sealed.
    MlKem768,
    /// Material owned by an external custodian; only a reference is stored.
    Managed,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Aes256Gcm => write!(f, "aes256-gcm"),
            KeyKind::MlKem768 => write!(f, "ml-kem-768"),
            KeyKind::Managed => write!(f, "managed"),
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = KeywardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes256-gcm" | "aes256gcm" => Ok(KeyKind::Aes256Gcm),
            "ml-kem-768" | "mlkem768" => Ok(KeyKind::MlKem768),
            "managed" => Ok(KeyKind::Managed),
            _ => Err(KeywardError::InvalidRequest(format!(
                "Unknown key kind: {s}"
            ))),
        }
    }
}

impl KeyKind {
    /// Produce fresh material for one new version of this kind.
    ///
    /// Managed kinds never generate locally; their material comes from the
    /// custodian resolution path.
    pub fn generate_material(&self) -> Result<VersionMaterial> {
        match self {
            KeyKind::Aes256Gcm => {
                let mut key = vec![0u8; 32];
                OsRng.fill_bytes(&mut key);
                Ok(VersionMaterial::Symmetric { key })
            }
            KeyKind::MlKem768 => {
                let (dk, ek) = MlKem768::generate(&mut OsRng);
                Ok(VersionMaterial::KeyPair {
                    public_key: ek.as_bytes().to_vec(),
                    private_key: dk.as_bytes().to_vec(),
                })
            }
            KeyKind::Managed => Err(KeywardError::Unsupported(
                "Managed keys are generated by the custodian, not locally".to_string(),
            )),
        }
    }
}

/// One version's material. Exactly one representation exists per version,
/// determined by the policy's kind. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersionMaterial {
    Symmetric {
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
    KeyPair {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        private_key: Vec<u8>,
    },
    Managed {
        key_id: String,
    },
}

impl fmt::Debug for VersionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionMaterial::Symmetric { .. } => f
                .debug_struct("Symmetric")
                .field("key", &"[REDACTED]")
                .finish(),
            VersionMaterial::KeyPair { public_key, .. } => f
                .debug_struct("KeyPair")
                .field("public_key_len", &public_key.len())
                .field("private_key", &"[REDACTED]")
                .finish(),
            VersionMaterial::Managed { key_id } => f
                .debug_struct("Managed")
                .field("key_id", key_id)
                .finish(),
        }
    }
}

/// Serde helper for binary fields stored as base64 inside the policy JSON.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(D::Error::custom)
    }
}

/// One generation of key material, numbered and immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyVersion {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub material: VersionMaterial,
}

/// The versioned record of all material ever generated for one named key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub name: String,
    pub kind: KeyKind,
    pub versions: BTreeMap<u32, KeyVersion>,
    pub latest_version: u32,
    /// Smallest version decrypt may still accept. Never decreases.
    pub min_decryption_version: u32,
    /// If nonzero, new encryptions use this version instead of the latest.
    pub min_encryption_version: u32,
    /// Custodian reference, present only for managed kinds.
    pub managed_key_id: Option<String>,
}

impl KeyPolicy {
    /// Logical storage path for a named policy.
    pub fn storage_path(name: &str) -> String {
        format!("keyward/policies/{name}")
    }

    /// Build a new policy with its first version.
    pub fn new(
        name: &str,
        kind: KeyKind,
        material: VersionMaterial,
        managed_key_id: Option<String>,
    ) -> Self {
        let first = KeyVersion {
            version: 1,
            created_at: Utc::now(),
            material,
        };
        let mut versions = BTreeMap::new();
        versions.insert(1, first);
        Self {
            name: name.to_string(),
            kind,
            versions,
            latest_version: 1,
            min_decryption_version: 1,
            min_encryption_version: 0,
            managed_key_id,
        }
    }

    /// Fetch a policy from storage. `Ok(None)` if it was never created.
    pub async fn load(backend: &dyn StorageBackend, name: &str) -> Result<Option<Self>> {
        let raw = backend
            .get(&Self::storage_path(name))
            .await
            .map_err(|e| KeywardError::Internal(format!("Loading key policy {name}: {e}")))?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the whole policy as one storage entry. The backend's single-key
    /// atomicity is the commit point: either the updated policy is visible or
    /// the prior one is.
    pub async fn persist(&self, backend: &dyn StorageBackend) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        backend
            .put(&Self::storage_path(&self.name), &bytes)
            .await
            .map_err(|e| {
                KeywardError::Internal(format!("Persisting key policy {}: {e}", self.name))
            })
    }

    /// Produce a new policy value with `version` appended. The input is left
    /// untouched; callers commit by persisting the returned value.
    pub fn append_version(&self, version: KeyVersion) -> Result<KeyPolicy> {
        if version.version != self.latest_version + 1 {
            return Err(KeywardError::Internal(format!(
                "Version {} does not follow latest version {} of key {}",
                version.version, self.latest_version, self.name
            )));
        }
        let mut updated = self.clone();
        updated.latest_version = version.version;
        updated.versions.insert(version.version, version);
        Ok(updated)
    }

    /// The version new encryptions use.
    pub fn encryption_version(&self) -> u32 {
        if self.min_encryption_version != 0 {
            self.min_encryption_version
        } else {
            self.latest_version
        }
    }

    fn version(&self, number: u32) -> Result<&KeyVersion> {
        self.versions.get(&number).ok_or_else(|| {
            KeywardError::KeyNotFound(format!("{} version {number}", self.name))
        })
    }

    /// Encrypt a payload under the active encryption version, producing a
    /// `kw:v{n}:{base64}` envelope.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let number = self.encryption_version();
        let version = self.version(number)?;

        let blob = match &version.material {
            VersionMaterial::Symmetric { key } => {
                let key: &[u8; 32] = key.as_slice().try_into().map_err(|_| {
                    KeywardError::Internal(format!("Corrupt symmetric key for {}", self.name))
                })?;
                crypto::seal(plaintext, key, self.name.as_bytes())?
            }
            VersionMaterial::KeyPair { public_key, .. } => {
                self.seal_encapsulated(plaintext, public_key)?
            }
            VersionMaterial::Managed { .. } => {
                return Err(KeywardError::Unsupported(format!(
                    "Key {} is custodian-managed; payload encryption is delegated",
                    self.name
                )));
            }
        };

        use base64::Engine;
        Ok(format!(
            "{CIPHERTEXT_PREFIX}{number}:{}",
            base64::engine::general_purpose::STANDARD.encode(blob)
        ))
    }

    /// Decrypt a `kw:v{n}:{base64}` envelope with version `n`'s material.
    ///
    /// Versions below the decryption floor fail by policy even though their
    /// material is still retained.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let (number, blob) = parse_envelope(ciphertext)?;

        if number < self.min_decryption_version {
            return Err(KeywardError::VersionBelowMinimum {
                requested: number,
                minimum: self.min_decryption_version,
            });
        }
        let version = self.version(number)?;

        match &version.material {
            VersionMaterial::Symmetric { key } => {
                let key: &[u8; 32] = key.as_slice().try_into().map_err(|_| {
                    KeywardError::Internal(format!("Corrupt symmetric key for {}", self.name))
                })?;
                crypto::open(&blob, key, self.name.as_bytes())
            }
            VersionMaterial::KeyPair { private_key, .. } => {
                self.open_encapsulated(&blob, private_key)
            }
            VersionMaterial::Managed { .. } => Err(KeywardError::Unsupported(format!(
                "Key {} is custodian-managed; payload decryption is delegated",
                self.name
            ))),
        }
    }

    /// ML-KEM-768 encapsulation + HKDF-SHA256 + AES-256-GCM.
    /// Payload layout: `kem_ciphertext (1088) || sealed`.
    fn seal_encapsulated(&self, plaintext: &[u8], public_key: &[u8]) -> Result<Vec<u8>> {
        let ek_array = ml_kem::array::Array::<u8, Ek768Size>::try_from(public_key)
            .map_err(|_| KeywardError::Internal(format!("Corrupt public key for {}", self.name)))?;
        let ek = Ek768::from_bytes(&ek_array);

        let (ct, shared_secret) = ek
            .encapsulate(&mut OsRng)
            .map_err(|_| KeywardError::Encryption("ML-KEM encapsulation failed".to_string()))?;

        let payload_key = derive_payload_key(shared_secret.as_ref())?;
        let sealed = crypto::seal(plaintext, &payload_key, self.name.as_bytes())?;

        let mut blob = Vec::with_capacity(KEM_CT_LEN + sealed.len());
        blob.extend_from_slice(&ct[..]);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    fn open_encapsulated(&self, blob: &[u8], private_key: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < KEM_CT_LEN {
            return Err(KeywardError::Decryption("Ciphertext too short".to_string()));
        }
        let (ct_bytes, sealed) = blob.split_at(KEM_CT_LEN);

        let dk_array = ml_kem::array::Array::<u8, Dk768Size>::try_from(private_key)
            .map_err(|_| KeywardError::Internal(format!("Corrupt private key for {}", self.name)))?;
        let dk = Dk768::from_bytes(&dk_array);

        let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ct_bytes)
            .map_err(|_| KeywardError::Decryption("Invalid KEM ciphertext".to_string()))?;
        let shared_secret = dk
            .decapsulate(&ct)
            .map_err(|_| KeywardError::Decryption("ML-KEM decapsulation failed".to_string()))?;

        let payload_key = derive_payload_key(shared_secret.as_ref())?;
        crypto::open(sealed, &payload_key, self.name.as_bytes())
    }
}

/// Derive the AEAD key for one payload from a KEM shared secret.
fn derive_payload_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(b"keyward-kem-v1", &mut okm)
        .map_err(|e| KeywardError::Internal(format!("HKDF expansion failed: {e}")))?;
    Ok(okm)
}

fn parse_envelope(ciphertext: &str) -> Result<(u32, Vec<u8>)> {
    let rest = ciphertext.strip_prefix(CIPHERTEXT_PREFIX).ok_or_else(|| {
        KeywardError::InvalidRequest("Invalid ciphertext: missing kw:v prefix".to_string())
    })?;
    let (version, payload) = rest.split_once(':').ok_or_else(|| {
        KeywardError::InvalidRequest("Invalid ciphertext: missing version separator".to_string())
    })?;
    let version: u32 = version.parse().map_err(|_| {
        KeywardError::InvalidRequest(format!("Invalid ciphertext version: {version}"))
    })?;

    use base64::Engine;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| KeywardError::InvalidRequest(format!("Invalid ciphertext encoding: {e}")))?;
    Ok((version, blob))
}
