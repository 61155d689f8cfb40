//! End-to-end handshakes against a live listener, including certificate
//! hot-swap: a handshake started after `reload()` returns must present the
//! new certificate.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use keyward_core::config::ListenerConfig;
use keyward_listener::{Listener, ListenerRegistry};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

fn fixture_der(name: &str) -> CertificateDer<'static> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .next()
        .unwrap()
        .unwrap()
}

/// Test-only verifier: accepts any server certificate so the client can
/// report which one the server actually presented.
#[derive(Debug)]
struct AcceptAnyCert(CryptoProvider);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn spawn_accept_loop(listener: Arc<Listener>) {
    tokio::spawn(async move {
        while let Ok((stream, _addr)) = listener.accept().await {
            let listener = listener.clone();
            tokio::spawn(async move {
                let _ = listener.secure(stream).await;
            });
        }
    });
}

/// Handshake with the listener and return the certificate it presented.
async fn presented_certificate(addr: std::net::SocketAddr) -> CertificateDer<'static> {
    let provider = rustls::crypto::ring::default_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(server_name, stream).await.unwrap();

    let (_, connection) = tls.get_ref();
    connection.peer_certificates().unwrap()[0].clone().into_owned()
}

#[tokio::test]
async fn handshake_after_reload_presents_the_new_certificate() {
    let tmp = TempDir::new().unwrap();
    let cert_path = tmp.path().join("server.pem");
    let key_path = tmp.path().join("server.key");
    std::fs::copy(fixture("server_a.pem"), &cert_path).unwrap();
    std::fs::copy(fixture("server_a.key"), &key_path).unwrap();

    let config = ListenerConfig {
        listener_type: "tcp".to_string(),
        address: "127.0.0.1:0".to_string(),
        tls_disable: false,
        tls_cert_file: Some(cert_path.display().to_string()),
        tls_key_file: Some(key_path.display().to_string()),
        tls_min_version: "tls12".to_string(),
    };
    let listener = Arc::new(ListenerRegistry::builtin().build(&config).await.unwrap());
    let addr = listener.local_addr().unwrap();
    spawn_accept_loop(listener.clone());

    assert_eq!(presented_certificate(addr).await, fixture_der("server_a.pem"));

    // Roll the on-disk pair and hot-swap it.
    std::fs::copy(fixture("server_b.pem"), &cert_path).unwrap();
    std::fs::copy(fixture("server_b.key"), &key_path).unwrap();
    listener.reload().unwrap();

    assert_eq!(presented_certificate(addr).await, fixture_der("server_b.pem"));
}

#[tokio::test]
async fn failed_reload_keeps_serving_the_previous_certificate() {
    let tmp = TempDir::new().unwrap();
    let cert_path = tmp.path().join("server.pem");
    let key_path = tmp.path().join("server.key");
    std::fs::copy(fixture("server_a.pem"), &cert_path).unwrap();
    std::fs::copy(fixture("server_a.key"), &key_path).unwrap();

    let config = ListenerConfig {
        listener_type: "tcp".to_string(),
        address: "127.0.0.1:0".to_string(),
        tls_disable: false,
        tls_cert_file: Some(cert_path.display().to_string()),
        tls_key_file: Some(key_path.display().to_string()),
        tls_min_version: "tls12".to_string(),
    };
    let listener = Arc::new(ListenerRegistry::builtin().build(&config).await.unwrap());
    let addr = listener.local_addr().unwrap();
    spawn_accept_loop(listener.clone());

    std::fs::write(&cert_path, b"corrupted during rollout").unwrap();
    assert!(listener.reload().is_err());

    assert_eq!(presented_certificate(addr).await, fixture_der("server_a.pem"));
}
