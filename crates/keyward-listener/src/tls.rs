//! Listener construction.
//!
//! Listener types are looked up in an explicit registry built at startup and
//! injected where needed; only `"tcp"` is built in. All configuration
//! validation — TLS version string, required files, certificate parsing —
//! happens before any socket is opened.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use keyward_core::config::ListenerConfig;
use keyward_core::error::{KeywardError, Result};

use crate::cert::CertificateProvider;

/// Minimum accepted TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMinVersion {
    Tls10,
    Tls11,
    Tls12,
}

impl fmt::Display for TlsMinVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsMinVersion::Tls10 => write!(f, "tls10"),
            TlsMinVersion::Tls11 => write!(f, "tls11"),
            TlsMinVersion::Tls12 => write!(f, "tls12"),
        }
    }
}

impl std::str::FromStr for TlsMinVersion {
    type Err = KeywardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tls10" => Ok(TlsMinVersion::Tls10),
            "tls11" => Ok(TlsMinVersion::Tls11),
            "tls12" => Ok(TlsMinVersion::Tls12),
            _ => Err(KeywardError::Configuration(format!(
                "'tls_min_version' value {s} is not supported, please specify one of [tls10, tls11, tls12]"
            ))),
        }
    }
}

impl TlsMinVersion {
    /// rustls implements nothing below TLS 1.2; tls10/tls11 floor to 1.2.
    fn protocol_versions(&self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static VERSIONS: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS12, &rustls::version::TLS13];
        VERSIONS
    }
}

/// One accepted connection, before or after TLS wrapping.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// A bound listener, optionally TLS-wrapped, with hot certificate reload.
pub struct Listener {
    inner: TcpListener,
    acceptor: Option<TlsAcceptor>,
    certs: Option<Arc<CertificateProvider>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("inner", &self.inner)
            .field("acceptor", &self.acceptor.is_some())
            .field("certs", &self.certs)
            .finish()
    }
}

impl Listener {
    /// Accept one TCP connection. The TLS handshake is performed separately
    /// (see [`Listener::secure`]) so callers can run it per-connection task.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// Complete the connection: run the TLS handshake when this listener is
    /// TLS-wrapped, pass the stream through otherwise.
    pub async fn secure(&self, stream: TcpStream) -> Result<Connection> {
        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| KeywardError::Internal(format!("TLS handshake failed: {e}")))?;
                Ok(Connection::Tls(Box::new(tls)))
            }
            None => Ok(Connection::Plain(stream)),
        }
    }

    /// Swap in freshly loaded certificate files. A failure is returned to the
    /// caller but never tears the listener down; the previous certificate
    /// stays in service.
    pub fn reload(&self) -> Result<()> {
        match &self.certs {
            Some(certs) => certs.reload(),
            None => Ok(()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    /// The live certificate provider, when TLS is enabled.
    pub fn certificates(&self) -> Option<&Arc<CertificateProvider>> {
        self.certs.as_ref()
    }
}

/// Builds one listener type from its configuration section.
#[async_trait]
pub trait ListenerBuilder: Send + Sync {
    async fn build(&self, config: &ListenerConfig) -> Result<Listener>;
}

/// The built-in `type = "tcp"` listener.
pub struct TcpListenerBuilder;

#[async_trait]
impl ListenerBuilder for TcpListenerBuilder {
    async fn build(&self, config: &ListenerConfig) -> Result<Listener> {
        let tls = if config.tls_disable {
            None
        } else {
            let min_version: TlsMinVersion = config.tls_min_version.parse()?;
            if min_version != TlsMinVersion::Tls12 {
                tracing::warn!(
                    requested = %min_version,
                    "TLS versions below 1.2 are not implemented; using tls12 as the minimum"
                );
            }
            let cert_file = config.tls_cert_file.as_deref().ok_or_else(|| {
                KeywardError::Configuration("'tls_cert_file' must be set".to_string())
            })?;
            let key_file = config.tls_key_file.as_deref().ok_or_else(|| {
                KeywardError::Configuration("'tls_key_file' must be set".to_string())
            })?;
            let provider = Arc::new(CertificateProvider::new(
                Path::new(cert_file),
                Path::new(key_file),
            )?);

            let server_config =
                rustls::ServerConfig::builder_with_protocol_versions(min_version.protocol_versions())
                    .with_no_client_auth()
                    .with_cert_resolver(provider.clone());
            Some((TlsAcceptor::from(Arc::new(server_config)), provider))
        };

        let inner = TcpListener::bind(config.address.as_str()).await.map_err(|e| {
            KeywardError::Configuration(format!("Cannot bind {}: {e}", config.address))
        })?;

        let (acceptor, certs) = match tls {
            Some((acceptor, certs)) => (Some(acceptor), Some(certs)),
            None => (None, None),
        };
        Ok(Listener {
            inner,
            acceptor,
            certs,
        })
    }
}

/// Explicit map from listener type name to its builder. Assembled at startup
/// and injected into whatever needs to construct listeners.
pub struct ListenerRegistry {
    builders: HashMap<String, Box<dyn ListenerBuilder>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// The built-in listener types.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("tcp", Box::new(TcpListenerBuilder));
        registry
    }

    pub fn register(&mut self, type_name: &str, builder: Box<dyn ListenerBuilder>) {
        self.builders.insert(type_name.to_string(), builder);
    }

    pub async fn build(&self, config: &ListenerConfig) -> Result<Listener> {
        let builder = self.builders.get(&config.listener_type).ok_or_else(|| {
            KeywardError::InvalidRequest(format!(
                "Unknown listener type: {}",
                config.listener_type
            ))
        })?;
        builder.build(config).await
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
