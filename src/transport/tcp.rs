use crate::error::{MqttError, Result};
use crate::transport::{BoxedStream, Transport, TransportReader, TransportWriter};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm; telemetry messages are small and frequent
    pub nodelay: bool,
    /// OS level keepalive, independent of the MQTT keep alive
    pub keepalive: Option<Duration>,
}

impl TcpConfig {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Opens a configured TCP stream; shared with the TLS transport, which runs
/// its handshake on top of it
pub(crate) async fn open_stream(config: &TcpConfig) -> Result<TcpStream> {
    let stream = timeout(config.connect_timeout, TcpStream::connect(config.addr))
        .await
        .map_err(|_| MqttError::Timeout)?
        .map_err(|e| MqttError::ConnectionError(format!("{}: {e}", config.addr)))?;

    stream.set_nodelay(config.nodelay)?;

    if let Some(keepalive_duration) = config.keepalive {
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(stream)
}

/// Plain TCP transport
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(TcpConfig::new(addr))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(MqttError::AlreadyConnected);
        }
        self.stream = Some(open_stream(&self.config).await?);
        Ok(())
    }

    fn into_split(self) -> Result<(TransportReader, TransportWriter)> {
        let stream = self.stream.ok_or(MqttError::NotConnected)?;
        let boxed: BoxedStream = Box::new(stream);
        Ok(tokio::io::split(boxed))
    }
}
