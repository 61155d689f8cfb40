pub mod cert;
pub mod tls;

pub use cert::CertificateProvider;
pub use tls::{Connection, Listener, ListenerRegistry, TlsMinVersion};
