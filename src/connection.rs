//! Broker session management
//!
//! One [`ConnectionManager`] is shared by every device simulator. It owns the
//! transport, serializes writes behind a single writer lock, tracks `QoS` 1
//! acknowledgments and reconnects with backoff when the broker goes away.

pub mod manager;
pub mod mock;
pub mod queue;
pub mod state;
pub mod stats;

use crate::error::PublishError;
use crate::packet::ProtocolVersion;
use crate::QoS;
use bytes::Bytes;
use rand::Rng;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

pub use manager::ConnectionManager;
pub use mock::{MockCall, MockPublisher};
pub use queue::{DropPolicy, OfflineQueue, QueueConfig};
pub use state::{Backoff, ConnectionEvent, ConnectionState, ReconnectConfig};
pub use stats::{ConnectionStats, StatsSnapshot};

pub(crate) fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub(crate) fn serialize_opt_secs<S: Serializer>(
    d: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// Certificate material for a TLS session, as file paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsPaths {
    /// CA bundle the broker certificate must chain to
    pub ca_certs: Option<PathBuf>,
    /// Client certificate for mutual authentication
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// SNI name; defaults to the broker host
    pub server_name: Option<String>,
    pub verify_server_cert: bool,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            ca_certs: None,
            client_cert: None,
            client_key: None,
            server_name: None,
            verify_server_cert: true,
        }
    }
}

/// Broker connection parameters shared by the whole session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// TLS is used when this is set
    pub tls: Option<TlsPaths>,
    #[serde(serialize_with = "serialize_secs")]
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Highest `QoS` any device may publish with; higher requests are downgraded
    pub qos_ceiling: QoS,
    #[serde(serialize_with = "serialize_secs")]
    pub connect_timeout: Duration,
    /// How long to wait for a PUBACK before retransmitting
    #[serde(serialize_with = "serialize_secs")]
    pub ack_timeout: Duration,
    /// Retransmissions of an unacknowledged `QoS` 1 message before giving up
    pub max_publish_retries: u32,
    /// Connection attempts at startup before the session fails
    pub startup_attempts: u32,
    pub reconnect: ReconnectConfig,
    pub queue: QueueConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: format!("mqtt-device-sim-{}", rand::rng().random::<u32>()),
            protocol_version: ProtocolVersion::V5,
            username: None,
            password: None,
            tls: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            qos_ceiling: QoS::AtLeastOnce,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            max_publish_retries: 3,
            startup_attempts: 5,
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsPaths) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn with_qos_ceiling(mut self, qos: QoS) -> Self {
        self.qos_ceiling = qos;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration, max_retries: u32) -> Self {
        self.ack_timeout = timeout;
        self.max_publish_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// `host:port` as used for DNS resolution and logging
    #[must_use]
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A message on its way to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Outcome of a successful publish call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// `QoS` 0 message written to the transport
    Sent,
    /// `QoS` 1 message acknowledged by the broker
    Acknowledged { packet_id: u16 },
    /// Connection is down; the message waits in the offline queue
    Queued,
}

/// The publishing surface device simulators depend on
///
/// Implemented by [`ConnectionManager`] and, for tests, [`MockPublisher`].
pub trait Publisher: Send + Sync + 'static {
    /// Publishes one message with the semantics of its `QoS`
    fn publish_message(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<Ack, PublishError>> + Send + '_;

    /// Ends the session; later publishes fail with `PublishError::Closed`
    fn close(&self) -> impl Future<Output = ()> + Send + '_;

    /// Delivery counters, when the implementation keeps any
    fn stats(&self) -> Option<StatsSnapshot> {
        None
    }
}
