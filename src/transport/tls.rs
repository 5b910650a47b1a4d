use crate::error::{MqttError, Result};
use crate::transport::tcp::{open_stream, TcpConfig};
use crate::transport::{BoxedStream, Transport, TransportReader, TransportWriter};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate verifier that accepts any server certificate
///
/// Only installed when `verify_server_cert` is off, for brokers running with
/// self-signed test certificates.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS transport configuration
#[derive(Debug)]
pub struct TlsConfig {
    pub addr: SocketAddr,
    /// Server hostname for SNI and certificate verification
    pub hostname: String,
    pub connect_timeout: Duration,
    /// Client certificate chain for mutual authentication
    pub client_cert: Option<Vec<CertificateDer<'static>>>,
    pub client_key: Option<PrivateKeyDer<'static>>,
    /// CA bundle the broker certificate must chain to
    pub root_certs: Option<Vec<CertificateDer<'static>>>,
    /// Trust the bundled web PKI roots in addition to `root_certs`
    pub use_system_roots: bool,
    pub verify_server_cert: bool,
}

impl TlsConfig {
    #[must_use]
    pub fn new(addr: SocketAddr, hostname: impl Into<String>) -> Self {
        Self {
            addr,
            hostname: hostname.into(),
            connect_timeout: Duration::from_secs(30),
            client_cert: None,
            client_key: None,
            root_certs: None,
            use_system_roots: true,
            verify_server_cert: true,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_system_roots(mut self, use_system: bool) -> Self {
        self.use_system_roots = use_system;
        self
    }

    /// Disabling verification accepts any broker certificate
    #[must_use]
    pub fn with_verify_server_cert(mut self, verify: bool) -> Self {
        self.verify_server_cert = verify;
        self
    }

    /// Loads the client certificate chain from a PEM file
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Tls` if the file cannot be read or holds no
    /// certificates
    pub fn load_client_cert_pem(&mut self, cert_path: impl AsRef<Path>) -> Result<()> {
        self.client_cert = Some(read_certs(cert_path.as_ref())?);
        Ok(())
    }

    /// Loads the client private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Tls` if the file cannot be read or holds no key
    pub fn load_client_key_pem(&mut self, key_path: impl AsRef<Path>) -> Result<()> {
        let path = key_path.as_ref();
        let pem = read_file(path)?;
        let key = rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| MqttError::Tls(format!("Invalid key file {}: {e}", path.display())))?
            .ok_or_else(|| {
                MqttError::Tls(format!("No private key found in {}", path.display()))
            })?;
        self.client_key = Some(key);
        Ok(())
    }

    /// Loads the CA bundle from a PEM file
    ///
    /// # Errors
    ///
    /// Returns `MqttError::Tls` if the file cannot be read or holds no
    /// certificates
    pub fn load_ca_cert_pem(&mut self, ca_path: impl AsRef<Path>) -> Result<()> {
        self.root_certs = Some(read_certs(ca_path.as_ref())?);
        Ok(())
    }

    fn tcp_config(&self) -> TcpConfig {
        TcpConfig::new(self.addr).with_connect_timeout(self.connect_timeout)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| MqttError::Tls(format!("Failed to read {}: {e}", path.display())))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .filter_map(std::result::Result::ok)
        .collect();
    if certs.is_empty() {
        return Err(MqttError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// TLS transport with optional client certificate authentication
#[derive(Debug)]
pub struct TlsTransport {
    config: TlsConfig,
    stream: Option<TlsStream<TcpStream>>,
}

impl TlsTransport {
    #[must_use]
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Builds the rustls client configuration
    fn build_tls_config(&mut self) -> Result<ClientConfig> {
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| MqttError::Tls(format!("Unsupported protocol versions: {e}")))?;

        let builder = if self.config.verify_server_cert {
            let mut root_store = RootCertStore::empty();
            if self.config.use_system_roots {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            if let Some(ref root_certs) = self.config.root_certs {
                for cert in root_certs {
                    root_store
                        .add(cert.clone())
                        .map_err(|e| MqttError::Tls(format!("Failed to add root cert: {e}")))?;
                }
            }
            builder.with_root_certificates(root_store)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
        };

        match (self.config.client_cert.clone(), self.config.client_key.as_ref()) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(cert, key.clone_key())
                .map_err(|e| MqttError::Tls(format!("Failed to configure client auth: {e}"))),
            (None, None) => Ok(builder.with_no_client_auth()),
            _ => Err(MqttError::Tls(
                "Client certificate and key must be provided together".to_string(),
            )),
        }
    }
}

impl Transport for TlsTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(MqttError::AlreadyConnected);
        }

        let connector = TlsConnector::from(Arc::new(self.build_tls_config()?));
        let domain = ServerName::try_from(self.config.hostname.clone())
            .map_err(|_| MqttError::Tls(format!("Invalid server name: {}", self.config.hostname)))?;

        let tcp_stream = open_stream(&self.config.tcp_config()).await?;

        let tls_stream = timeout(
            self.config.connect_timeout,
            connector.connect(domain, tcp_stream),
        )
        .await
        .map_err(|_| MqttError::Timeout)?
        .map_err(|e| MqttError::Tls(format!("TLS handshake failed: {e}")))?;

        self.stream = Some(tls_stream);
        Ok(())
    }

    fn into_split(self) -> Result<(TransportReader, TransportWriter)> {
        let stream = self.stream.ok_or(MqttError::NotConnected)?;
        let boxed: BoxedStream = Box::new(stream);
        Ok(tokio::io::split(boxed))
    }
}
