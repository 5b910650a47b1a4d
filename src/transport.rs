pub mod packet_io;
pub mod tcp;
pub mod tls;

use crate::error::Result;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

pub use packet_io::{PacketReader, PacketWriter};
pub use tcp::{TcpConfig, TcpTransport};
pub use tls::{TlsConfig, TlsTransport};

/// Any byte stream a broker session can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Read half handed to the packet reader task
pub type TransportReader = ReadHalf<BoxedStream>;

/// Write half guarded by the connection manager's writer lock
pub type TransportWriter = WriteHalf<BoxedStream>;

pub trait Transport: Send {
    /// Establishes the connection (TCP connect, plus the TLS handshake for
    /// secure transports)
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Splits the connected stream so reading and writing can proceed from
    /// separate tasks
    ///
    /// # Errors
    ///
    /// Returns `MqttError::NotConnected` if `connect` has not succeeded
    fn into_split(self) -> Result<(TransportReader, TransportWriter)>;
}

/// Enum for the supported transport types
#[derive(Debug)]
pub enum TransportType {
    Tcp(TcpTransport),
    Tls(Box<TlsTransport>),
}

impl TransportType {
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportType::Tls(_))
    }
}

impl Transport for TransportType {
    async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Tcp(t) => t.connect().await,
            Self::Tls(t) => t.connect().await,
        }
    }

    fn into_split(self) -> Result<(TransportReader, TransportWriter)> {
        match self {
            Self::Tcp(t) => t.into_split(),
            Self::Tls(t) => t.into_split(),
        }
    }
}
