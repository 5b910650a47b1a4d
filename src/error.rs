use crate::QoS;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Wire and transport level errors
///
/// These never reach device simulators directly; the connection manager
/// folds them into [`ConnectionError`] or [`PublishError`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection refused (return code {0:#04x})")]
    ConnectionRefused(u8),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Timeout")]
    Timeout,
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

/// A generator was configured with parameters outside its domain.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid generator spec: {0}")]
pub struct InvalidSpec(pub String);

/// Configuration rejected at load time. Nothing starts when one of these is
/// returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(String),

    #[error("configuration is not valid JSON: {0}")]
    Parse(String),

    #[error("missing required field `{path}`")]
    MissingField { path: String },

    #[error("`{path}` must be {expected}")]
    TypeMismatch { path: String, expected: &'static str },

    #[error("`{path}` is out of range: {reason}")]
    OutOfDomain { path: String, reason: String },

    #[error("duplicate device name `{name}`")]
    DuplicateDevice { name: String },

    #[error("duplicate topic `{topic}` used by devices `{first}` and `{second}`")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },
}

impl ConfigError {
    pub(crate) fn out_of_domain(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::OutOfDomain {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Attaches the location of a rejected generator definition.
    pub(crate) fn from_spec(path: impl Into<String>, err: InvalidSpec) -> Self {
        ConfigError::out_of_domain(path, err.0)
    }
}

/// Failure to bring up (or keep up) the broker session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("could not resolve broker address `{0}`")]
    Resolve(String),

    #[error("transport failure: {0}")]
    Transport(MqttError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("broker refused the connection (return code {0:#04x})")]
    Refused(u8),

    #[error("timed out waiting for the broker")]
    Timeout,

    #[error("gave up after {attempts} connection attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },

    #[error("broker unreachable for longer than {0:?}")]
    MaxWaitExceeded(Duration),

    #[error("connection manager is closed")]
    Closed,
}

impl From<MqttError> for ConnectionError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::Timeout => ConnectionError::Timeout,
            MqttError::ConnectionRefused(code) => ConnectionError::Refused(code),
            MqttError::Tls(msg) => ConnectionError::Tls(msg),
            other => ConnectionError::Transport(other),
        }
    }
}

/// Per-message publish failure. Device simulators log these and keep ticking.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    #[error("offline queue full ({depth} messages), dropped {qos:?} message")]
    Backpressure { depth: usize, qos: QoS },

    #[error("no PUBACK for packet {packet_id} after {attempts} attempts")]
    AckTimeout { packet_id: u16, attempts: u32 },

    #[error("broker rejected packet {packet_id} (reason code {reason_code:#04x})")]
    Rejected { packet_id: u16, reason_code: u8 },

    #[error("transport failure: {0}")]
    Transport(MqttError),

    #[error("payload could not be serialized: {0}")]
    Serialize(String),

    #[error("connection manager is closed")]
    Closed,
}

impl From<MqttError> for PublishError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::NotConnected => PublishError::NotConnected,
            other => PublishError::Transport(other),
        }
    }
}
