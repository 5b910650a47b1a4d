//! # MQTT Device Telemetry Simulator
//!
//! Drives many simulated devices from a declarative JSON configuration. Each
//! device produces synthetic sensor readings on its own schedule and publishes
//! them through a single shared broker connection.
//!
//! ## CRITICAL: NO EVENT LOOPS
//!
//! The connection layer uses direct async methods for every operation and
//! background tasks only for continuous work (packet reading, keepalive,
//! reconnect). Device simulators are plain tokio tasks that sleep between
//! ticks. There is no command channel between devices and the broker session.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_device_sim::{Orchestrator, SimulationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SimulationConfig::from_path("devices.json")?;
//!
//!     let session = Orchestrator::new(config.registry, config.connection)
//!         .with_seed(7)
//!         .start()
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     let report = session.stop().await;
//!     println!("{report:?}");
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod generator;
pub mod orchestrator;
pub mod packet;
pub mod packet_id;
pub mod payload;
pub mod registry;
pub mod simulator;
pub mod transport;

pub use config::SimulationConfig;
pub use connection::{
    Ack, ConnectionConfig, ConnectionManager, ConnectionState, DropPolicy, MockPublisher,
    OutboundMessage, Publisher, QueueConfig, ReconnectConfig, StatsSnapshot, TlsPaths,
};
pub use error::{ConfigError, ConnectionError, InvalidSpec, MqttError, PublishError, Result};
pub use generator::{FieldValue, Generator, GeneratorKind, GeneratorState, OutputType};
pub use orchestrator::{Orchestrator, SessionReport, SimulationSession, StopReason};
pub use packet::ProtocolVersion;
pub use payload::Payload;
pub use registry::{DeviceProfile, FieldSpec, IntervalSpec, Registry};
pub use simulator::{DeviceReport, DeviceSimulator, DeviceState};

use serde::Serialize;

/// Delivery guarantee for a published message.
///
/// Only the two levels a telemetry publisher needs are modeled; `ExactlyOnce`
/// is rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    /// Parses a wire-level `QoS` value.
    ///
    /// # Errors
    ///
    /// Returns `MqttError::InvalidQoS` for anything other than 0 or 1.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}
