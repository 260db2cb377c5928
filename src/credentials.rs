//! Transport credentials
//!
//! The client never reads certificates itself. It asks a [`CredentialSupplier`]
//! for a connector on every connect attempt, so rotated files are picked up on
//! the next reconnect.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_tungstenite::Connector;
use tracing::debug;

use crate::config::{CredentialConfig, CredentialSource};
use crate::error::DaemonError;

/// Produces the connector used to open the daemon socket.
pub trait CredentialSupplier: Send + Sync {
    fn connector(&self) -> Result<Connector, DaemonError>;
}

/// No TLS, for `ws://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTransport;

impl CredentialSupplier for PlainTransport {
    fn connector(&self) -> Result<Connector, DaemonError> {
        Ok(Connector::Plain)
    }
}

/// An already-built rustls configuration.
#[derive(Debug, Clone)]
pub struct PreparedTls(pub Arc<ClientConfig>);

impl CredentialSupplier for PreparedTls {
    fn connector(&self) -> Result<Connector, DaemonError> {
        Ok(Connector::Rustls(Arc::clone(&self.0)))
    }
}

/// Client certificate and key read from PEM files.
#[derive(Debug, Clone)]
pub struct TlsCredentials {
    cert: PathBuf,
    key: PathBuf,
    ca_cert: Option<PathBuf>,
    server_name: Option<String>,
}

impl TlsCredentials {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            ca_cert: None,
            server_name: None,
        }
    }

    /// `<prefix>.crt` and `<prefix>.key`.
    pub fn from_prefix(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref();
        Self::new(with_suffix(prefix, ".crt"), with_suffix(prefix, ".key"))
    }

    /// `~/.daemon-link/ssl/client.{crt,key}`, trusting `ca.crt` from the same
    /// directory when it exists.
    pub fn from_home() -> Result<Self, DaemonError> {
        let dir = default_ssl_dir()
            .ok_or_else(|| DaemonError::Credentials("No home directory".into()))?;
        let mut credentials = Self::from_prefix(dir.join("client"));
        let ca = dir.join("ca.crt");
        if ca.exists() {
            credentials.ca_cert = Some(ca);
        }
        Ok(credentials)
    }

    pub fn with_ca_cert(mut self, ca_cert: impl Into<PathBuf>) -> Self {
        self.ca_cert = Some(ca_cert.into());
        self
    }

    /// Verify the daemon certificate against `name` instead of the URL host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    pub fn key_path(&self) -> &Path {
        &self.key
    }

    pub fn client_config(&self) -> Result<ClientConfig, DaemonError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let certs = load_certs(&self.cert)?;
        let key = load_key(&self.key)?;

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;

        let roots = match &self.ca_cert {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca)? {
                    roots.add(cert).map_err(tls_error)?;
                }
                roots
            }
            None => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        };

        let config = match &self.server_name {
            Some(name) => {
                let verifier = NamedServerVerifier::new(roots, name, provider)?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
                    .with_client_auth_cert(certs, key)
            }
            None => builder
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key),
        }
        .map_err(tls_error)?;

        debug!(cert = %self.cert.display(), "TLS client credentials loaded");
        Ok(config)
    }
}

impl CredentialSupplier for TlsCredentials {
    fn connector(&self) -> Result<Connector, DaemonError> {
        Ok(Connector::Rustls(Arc::new(self.client_config()?)))
    }
}

/// Pick the supplier described by the config file.
pub fn from_config(config: &CredentialConfig) -> Result<Arc<dyn CredentialSupplier>, DaemonError> {
    let credentials = match config.source {
        CredentialSource::None => return Ok(Arc::new(PlainTransport)),
        CredentialSource::Prefix => {
            let prefix = config.prefix.as_ref().ok_or_else(|| {
                DaemonError::Config("credentials.prefix is required for source = \"prefix\"".into())
            })?;
            TlsCredentials::from_prefix(prefix)
        }
        CredentialSource::Home => TlsCredentials::from_home()?,
    };

    let credentials = match &config.ca_cert {
        Some(ca) => credentials.with_ca_cert(ca),
        None => credentials,
    };
    let credentials = match &config.server_name {
        Some(name) => credentials.with_server_name(name),
        None => credentials,
    };
    Ok(Arc::new(credentials))
}

pub fn default_ssl_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".daemon-link").join("ssl"))
}

/// Checks the chain with webpki but against a fixed name. Daemons commonly
/// present certificates issued for a service name rather than the host they
/// are reached through.
#[derive(Debug)]
struct NamedServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    server_name: ServerName<'static>,
}

impl NamedServerVerifier {
    fn new(
        roots: RootCertStore,
        name: &str,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, DaemonError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| DaemonError::Credentials(format!("Invalid CA certificate: {}", e)))?;
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| DaemonError::Credentials(format!("Invalid server name {}: {}", name, e)))?;
        Ok(Self { inner, server_name })
    }
}

impl ServerCertVerifier for NamedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

fn open(path: &Path) -> Result<BufReader<File>, DaemonError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DaemonError::Credentials(format!("{}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, DaemonError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DaemonError::Credentials(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(DaemonError::Credentials(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, DaemonError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| DaemonError::Credentials(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| DaemonError::Credentials(format!("{}: no private key found", path.display())))
}

fn tls_error(e: rustls::Error) -> DaemonError {
    DaemonError::Credentials(format!("TLS configuration failed: {}", e))
}
