//! Configuration document loading
//!
//! The document is deserialized into raw structs that mirror its layout,
//! with unknown keys rejected. A second pass checks value domains and builds
//! the runtime types. Both passes report the exact location of a rejected
//! value (`devices[2].fields[0].min`).

use crate::connection::{
    ConnectionConfig, DropPolicy, QueueConfig, ReconnectConfig, TlsPaths,
};
use crate::error::ConfigError;
use crate::packet::ProtocolVersion;
use crate::registry::{RawDevice, Registry};
use crate::QoS;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_path_to_error::Segment;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of `key` below `base`
pub(crate) fn child(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn located(path: String) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path
    }
}

/// Deserializes `value`, turning serde's complaint into a located
/// [`ConfigError`]
pub(crate) fn deserialize<T: DeserializeOwned>(value: &Value) -> Result<T, ConfigError> {
    serde_path_to_error::deserialize(value).map_err(rejection)
}

fn rejection(err: serde_path_to_error::Error<serde_json::Error>) -> ConfigError {
    let mut path = String::new();
    let mut last_key = None;
    for segment in err.path().iter() {
        match segment {
            Segment::Seq { index } => {
                path = format!("{path}[{index}]");
                last_key = None;
            }
            Segment::Map { key } => {
                path = child(&path, key);
                last_key = Some(key.as_str());
            }
            other => {
                path = child(&path, &other.to_string());
                last_key = None;
            }
        }
    }

    // Reading from a `Value` carries no line/column suffix, so the message
    // is serde's own wording
    let message = err.inner().to_string();
    if let Some(field) = backticked(&message, "missing field `") {
        return ConfigError::MissingField {
            path: child(&path, field),
        };
    }
    if let Some(field) = backticked(&message, "unknown field `") {
        let path = if last_key == Some(field) {
            path
        } else {
            child(&path, field)
        };
        return ConfigError::out_of_domain(path, "unknown setting");
    }
    if let Some(rest) = message.strip_prefix("invalid type: ") {
        let expected = rest.rsplit_once(", expected ").map_or("", |(_, e)| e);
        return ConfigError::TypeMismatch {
            path: located(path),
            expected: describe(expected),
        };
    }
    ConfigError::out_of_domain(located(path), message)
}

fn backticked<'m>(message: &'m str, prefix: &str) -> Option<&'m str> {
    message.strip_prefix(prefix)?.split('`').next()
}

fn describe(expected: &str) -> &'static str {
    match expected {
        "u8" | "u16" | "u32" | "u64" | "usize" => "a non-negative integer",
        "f64" => "a number",
        "a string" | "path string" | "variant identifier" => "a string",
        "a boolean" => "a boolean",
        "a sequence" => "an array",
        e if e == "a map" || e.starts_with("struct ") => "an object",
        _ => "a value of another type",
    }
}

/// Seconds as a JSON number, fractions allowed
pub(crate) fn seconds(secs: f64, path: &str) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::out_of_domain(
            path,
            "must be a non-negative number of seconds",
        ));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::out_of_domain(path, "too large"))
}

pub(crate) fn positive_seconds(secs: f64, path: &str) -> Result<Duration, ConfigError> {
    let duration = seconds(secs, path)?;
    if duration.is_zero() {
        return Err(ConfigError::out_of_domain(path, "must be greater than zero"));
    }
    Ok(duration)
}

pub(crate) fn qos(level: u8, path: &str) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Err(ConfigError::out_of_domain(
            path,
            "QoS 2 is not supported, use 0 or 1",
        )),
        other => Err(ConfigError::out_of_domain(path, format!("invalid QoS {other}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTls {
    ca_certs: Option<PathBuf>,
    certfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    #[serde(default)]
    insecure: bool,
    server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReconnect {
    initial_delay: Option<f64>,
    max_delay: Option<f64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_attempts: Option<u32>,
    max_total_wait: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueue {
    depth: Option<usize>,
    drop_policy: Option<String>,
}

/// The `broker` section as written
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawBroker {
    host: String,
    port: Option<u16>,
    protocol_version: Option<u8>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls: Option<RawTls>,
    keep_alive: Option<f64>,
    clean_session: Option<bool>,
    qos_ceiling: Option<u8>,
    connect_timeout: Option<f64>,
    ack_timeout: Option<f64>,
    max_publish_retries: Option<u32>,
    startup_attempts: Option<u32>,
    reconnect: Option<RawReconnect>,
    queue: Option<RawQueue>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    broker: RawBroker,
    devices: Vec<RawDevice>,
}

fn build_tls(raw: RawTls, path: &str) -> Result<TlsPaths, ConfigError> {
    match (&raw.certfile, &raw.keyfile) {
        (Some(_), None) => {
            return Err(ConfigError::MissingField {
                path: child(path, "keyfile"),
            })
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingField {
                path: child(path, "certfile"),
            })
        }
        _ => {}
    }
    Ok(TlsPaths {
        ca_certs: raw.ca_certs,
        client_cert: raw.certfile,
        client_key: raw.keyfile,
        server_name: raw.server_name,
        verify_server_cert: !raw.insecure,
    })
}

fn build_reconnect(raw: RawReconnect, path: &str) -> Result<ReconnectConfig, ConfigError> {
    let mut config = ReconnectConfig::default();
    if let Some(secs) = raw.initial_delay {
        config.initial_delay = positive_seconds(secs, &child(path, "initial_delay"))?;
    }
    if let Some(secs) = raw.max_delay {
        config.max_delay = positive_seconds(secs, &child(path, "max_delay"))?;
    }
    if config.max_delay < config.initial_delay {
        return Err(ConfigError::out_of_domain(
            child(path, "max_delay"),
            "must not be smaller than initial_delay",
        ));
    }
    if let Some(m) = raw.multiplier {
        if !m.is_finite() || m < 1.0 {
            return Err(ConfigError::out_of_domain(
                child(path, "multiplier"),
                "must be at least 1",
            ));
        }
        config.multiplier = m;
    }
    if let Some(j) = raw.jitter {
        if !(0.0..=1.0).contains(&j) {
            return Err(ConfigError::out_of_domain(
                child(path, "jitter"),
                "must lie within [0, 1]",
            ));
        }
        config.jitter = j;
    }
    if let Some(n) = raw.max_attempts {
        config.max_attempts = n;
    }
    config.max_total_wait = raw
        .max_total_wait
        .map(|secs| positive_seconds(secs, &child(path, "max_total_wait")))
        .transpose()?;
    Ok(config)
}

fn build_queue(raw: RawQueue, path: &str) -> Result<QueueConfig, ConfigError> {
    let mut config = QueueConfig::default();
    if let Some(depth) = raw.depth {
        config.depth = depth;
    }
    if let Some(policy) = raw.drop_policy {
        config.drop_policy = policy
            .parse::<DropPolicy>()
            .map_err(|reason| ConfigError::out_of_domain(child(path, "drop_policy"), reason))?;
    }
    Ok(config)
}

/// Builds the connection settings from the `broker` section found at `path`
pub(crate) fn build_broker(raw: RawBroker, path: &str) -> Result<ConnectionConfig, ConfigError> {
    if raw.host.is_empty() {
        return Err(ConfigError::out_of_domain(
            child(path, "host"),
            "must not be empty",
        ));
    }
    let mut config = ConnectionConfig::new(raw.host, 1883);

    if let Some(port) = raw.port {
        if port == 0 {
            return Err(ConfigError::out_of_domain(child(path, "port"), "must not be 0"));
        }
        config.port = port;
    }
    if let Some(level) = raw.protocol_version {
        config.protocol_version = ProtocolVersion::from_level(level).ok_or_else(|| {
            ConfigError::out_of_domain(
                child(path, "protocol_version"),
                "must be 4 (MQTT 3.1.1) or 5",
            )
        })?;
    }
    if let Some(client_id) = raw.client_id {
        config.client_id = client_id;
    }
    match (raw.username, raw.password) {
        (Some(username), password) => config = config.with_credentials(username, password),
        (None, Some(_)) => {
            return Err(ConfigError::MissingField {
                path: child(path, "username"),
            })
        }
        (None, None) => {}
    }
    config.tls = raw
        .tls
        .map(|tls| build_tls(tls, &child(path, "tls")))
        .transpose()?;
    if let Some(secs) = raw.keep_alive {
        let at = child(path, "keep_alive");
        let duration = seconds(secs, &at)?;
        // CONNECT carries whole seconds
        if duration.subsec_nanos() != 0 {
            return Err(ConfigError::out_of_domain(
                at,
                "must be a whole number of seconds",
            ));
        }
        if duration.as_secs() > u64::from(u16::MAX) {
            return Err(ConfigError::out_of_domain(at, "must be at most 65535 seconds"));
        }
        config.keep_alive = duration;
    }
    if let Some(clean) = raw.clean_session {
        config.clean_session = clean;
    }
    if let Some(level) = raw.qos_ceiling {
        config.qos_ceiling = qos(level, &child(path, "qos_ceiling"))?;
    }
    if let Some(secs) = raw.connect_timeout {
        config.connect_timeout = positive_seconds(secs, &child(path, "connect_timeout"))?;
    }
    if let Some(secs) = raw.ack_timeout {
        config.ack_timeout = positive_seconds(secs, &child(path, "ack_timeout"))?;
    }
    if let Some(retries) = raw.max_publish_retries {
        config.max_publish_retries = retries;
    }
    if let Some(attempts) = raw.startup_attempts {
        if attempts == 0 {
            return Err(ConfigError::out_of_domain(
                child(path, "startup_attempts"),
                "must be at least 1",
            ));
        }
        config.startup_attempts = attempts;
    }
    if let Some(reconnect) = raw.reconnect {
        config.reconnect = build_reconnect(reconnect, &child(path, "reconnect"))?;
    }
    if let Some(queue) = raw.queue {
        config.queue = build_queue(queue, &child(path, "queue"))?;
    }
    Ok(config)
}

/// Everything needed to run a simulation, validated as a whole
#[derive(Debug, Clone, Serialize)]
pub struct SimulationConfig {
    #[serde(rename = "broker")]
    pub connection: ConnectionConfig,
    #[serde(rename = "devices")]
    pub registry: Registry,
}

impl SimulationConfig {
    /// Parses and validates a configuration document
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found; no partial configuration is
    /// ever returned
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let document: Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(&document)
    }

    /// Validates an already parsed document
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found
    pub fn from_value(document: &Value) -> Result<Self, ConfigError> {
        let raw: RawDocument = deserialize(document)?;
        let connection = build_broker(raw.broker, "broker")?;
        let registry = Registry::from_raw(raw.devices, "devices")?;
        Ok(Self {
            connection,
            registry,
        })
    }

    /// Reads and validates a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read, otherwise as
    /// [`SimulationConfig::from_json`]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }
}
