//! Hot-swappable server certificates.
//!
//! The provider owns the one live certificate/key pair. Handshakes clone an
//! `Arc` to the whole pair under a read lock, so a connection mid-handshake
//! keeps the pair it started with even while a reload swaps in a new one.
//! A failed reload leaves the previous pair in service.

use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};

use keyward_core::error::{KeywardError, Result};

/// A fully-formed certificate chain + signing key, with load metadata.
pub struct LoadedCertificate {
    certified: Arc<CertifiedKey>,
    pub loaded_at: DateTime<Utc>,
    /// SHA-256 of the leaf certificate, hex-encoded.
    pub fingerprint: String,
}

impl fmt::Debug for LoadedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedCertificate")
            .field("loaded_at", &self.loaded_at)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Loads and hot-swaps the server certificate pair read from PEM files.
pub struct CertificateProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Option<Arc<LoadedCertificate>>>,
}

impl fmt::Debug for CertificateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateProvider")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

impl CertificateProvider {
    /// Load the pair eagerly; a missing or malformed file fails construction.
    pub fn new(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let provider = Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            current: RwLock::new(None),
        };
        provider.reload()?;
        Ok(provider)
    }

    /// Read and parse both files into one new pair. No lock is held here;
    /// parsing happens entirely before the swap.
    fn load(&self) -> Result<LoadedCertificate> {
        let cert_file = std::fs::File::open(&self.cert_path).map_err(|e| {
            KeywardError::Configuration(format!(
                "Cannot open TLS cert {}: {e}",
                self.cert_path.display()
            ))
        })?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                KeywardError::Configuration(format!(
                    "Invalid PEM data in {}: {e}",
                    self.cert_path.display()
                ))
            })?;
        if certs.is_empty() {
            return Err(KeywardError::Configuration(format!(
                "No certificates found in {}",
                self.cert_path.display()
            )));
        }

        let key_file = std::fs::File::open(&self.key_path).map_err(|e| {
            KeywardError::Configuration(format!(
                "Cannot open TLS key {}: {e}",
                self.key_path.display()
            ))
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| {
                KeywardError::Configuration(format!(
                    "Invalid key data in {}: {e}",
                    self.key_path.display()
                ))
            })?
            .ok_or_else(|| {
                KeywardError::Configuration(format!(
                    "No private key found in {}",
                    self.key_path.display()
                ))
            })?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
            KeywardError::Configuration(format!(
                "Unusable TLS key in {}: {e}",
                self.key_path.display()
            ))
        })?;

        let fingerprint = hex::encode(Sha256::digest(certs[0].as_ref()));
        Ok(LoadedCertificate {
            certified: Arc::new(CertifiedKey::new(certs, signing_key)),
            loaded_at: Utc::now(),
            fingerprint,
        })
    }

    /// Re-read the files and swap the live pair in one step. On failure the
    /// previous pair stays in service and the error is returned.
    pub fn reload(&self) -> Result<()> {
        let loaded = Arc::new(self.load()?);
        tracing::info!(
            cert = %self.cert_path.display(),
            fingerprint = %loaded.fingerprint,
            "Loaded TLS certificate"
        );
        let mut current = self
            .current
            .write()
            .map_err(|_| KeywardError::Internal("Certificate lock poisoned".to_string()))?;
        *current = Some(loaded);
        Ok(())
    }

    /// The live pair's metadata.
    pub fn current(&self) -> Result<Arc<LoadedCertificate>> {
        let current = self
            .current
            .read()
            .map_err(|_| KeywardError::Internal("Certificate lock poisoned".to_string()))?;
        current.clone().ok_or_else(|| {
            KeywardError::Configuration("No TLS certificate has been loaded".to_string())
        })
    }
}

impl ResolvesServerCert for CertificateProvider {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let current = self.current.read().ok()?;
        current.as_ref().map(|c| c.certified.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    fn staged_pair(tmp: &TempDir, cert: &str, key: &str) -> (PathBuf, PathBuf) {
        let cert_path = tmp.path().join("server.pem");
        let key_path = tmp.path().join("server.key");
        std::fs::copy(fixture(cert), &cert_path).unwrap();
        std::fs::copy(fixture(key), &key_path).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_fixture_pair() {
        let provider =
            CertificateProvider::new(&fixture("server_a.pem"), &fixture("server_a.key")).unwrap();
        let current = provider.current().unwrap();
        assert_eq!(current.fingerprint.len(), 64);
    }

    #[test]
    fn missing_cert_file_is_a_configuration_error() {
        let result =
            CertificateProvider::new(Path::new("/nonexistent/cert.pem"), &fixture("server_a.key"));
        assert!(matches!(result, Err(KeywardError::Configuration(_))));
    }

    #[test]
    fn malformed_pem_is_a_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let cert_path = tmp.path().join("garbage.pem");
        std::fs::write(&cert_path, b"not pem at all").unwrap();
        let result = CertificateProvider::new(&cert_path, &fixture("server_a.key"));
        assert!(matches!(result, Err(KeywardError::Configuration(_))));
    }

    #[test]
    fn reload_swaps_the_pair() {
        let tmp = TempDir::new().unwrap();
        let (cert_path, key_path) = staged_pair(&tmp, "server_a.pem", "server_a.key");
        let provider = CertificateProvider::new(&cert_path, &key_path).unwrap();
        let before = provider.current().unwrap();

        std::fs::copy(fixture("server_b.pem"), &cert_path).unwrap();
        std::fs::copy(fixture("server_b.key"), &key_path).unwrap();
        provider.reload().unwrap();

        let after = provider.current().unwrap();
        assert_ne!(before.fingerprint, after.fingerprint);
    }

    #[test]
    fn failed_reload_keeps_previous_pair_in_service() {
        let tmp = TempDir::new().unwrap();
        let (cert_path, key_path) = staged_pair(&tmp, "server_a.pem", "server_a.key");
        let provider = CertificateProvider::new(&cert_path, &key_path).unwrap();
        let before = provider.current().unwrap();

        std::fs::write(&cert_path, b"corrupted during rollout").unwrap();
        assert!(provider.reload().is_err());

        let after = provider.current().unwrap();
        assert_eq!(before.fingerprint, after.fingerprint);
    }

    #[test]
    fn handshake_in_flight_keeps_its_pair_across_a_swap() {
        let tmp = TempDir::new().unwrap();
        let (cert_path, key_path) = staged_pair(&tmp, "server_a.pem", "server_a.key");
        let provider = CertificateProvider::new(&cert_path, &key_path).unwrap();

        // A handshake holds an Arc to the whole pair it resolved.
        let held = provider.current().unwrap();
        let held_fingerprint = held.fingerprint.clone();

        std::fs::copy(fixture("server_b.pem"), &cert_path).unwrap();
        std::fs::copy(fixture("server_b.key"), &key_path).unwrap();
        provider.reload().unwrap();

        // The held pair is unchanged; only new resolutions see the swap.
        assert_eq!(held.fingerprint, held_fingerprint);
        assert_ne!(provider.current().unwrap().fingerprint, held_fingerprint);
    }
}
