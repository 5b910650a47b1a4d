//! Session lifecycle
//!
//! [`Orchestrator::start`] connects the shared [`ConnectionManager`] and
//! spawns one task per device. [`SimulationSession::stop`] broadcasts
//! shutdown, waits a bounded time for the devices, then closes the
//! connection and returns a [`SessionReport`].

use crate::connection::{ConnectionConfig, ConnectionManager, Publisher, StatsSnapshot};
use crate::error::ConnectionError;
use crate::registry::Registry;
use crate::simulator::{DeviceHandle, DeviceReport, DeviceSimulator, DeviceState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{Id, JoinSet};
use tokio::time::{timeout_at, Instant};

/// How long `stop` waits for devices to finish in-flight publishes
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a session run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped by the caller
    Requested,
    /// Ctrl-C
    Interrupted,
    /// The configured run duration elapsed
    DurationElapsed,
    /// The broker connection failed permanently
    ConnectionFailed,
    /// Every device ran out of field values
    DevicesFinished,
}

fn serialize_failure<S: Serializer>(
    failure: &Option<ConnectionError>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(err) => s.collect_str(err),
        None => s.serialize_none(),
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub reason: StopReason,
    #[serde(serialize_with = "crate::connection::serialize_secs")]
    pub elapsed: Duration,
    /// Devices that stopped on their own, in registry order
    pub devices: Vec<DeviceReport>,
    /// Devices whose task had to be aborted or panicked
    pub aborted: Vec<String>,
    pub connection: Option<StatsSnapshot>,
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<ConnectionError>,
}

impl SessionReport {
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.devices.iter().map(|d| d.published).sum()
    }

    #[must_use]
    pub fn total_failed(&self) -> u64 {
        self.devices.iter().map(|d| d.failed).sum()
    }

    fn log(&self) {
        for device in &self.devices {
            tracing::info!(
                device = %device.name,
                ticks = device.ticks,
                published = device.published,
                queued = device.queued,
                failed = device.failed,
                exhausted = device.exhausted,
                "Device summary"
            );
        }
        if let Some(stats) = &self.connection {
            tracing::info!(
                connects = stats.connects,
                reconnects = stats.reconnects,
                published = stats.published(),
                acknowledged = stats.acknowledged,
                retransmissions = stats.retransmissions,
                dropped_qos0 = stats.dropped_qos0,
                dropped_qos1 = stats.dropped_qos1,
                "Connection summary"
            );
            if stats.dropped_qos1 > 0 {
                tracing::warn!(
                    dropped = stats.dropped_qos1,
                    "QoS 1 messages were dropped under backpressure"
                );
            }
        }
        if !self.aborted.is_empty() {
            tracing::warn!(devices = ?self.aborted, "Device tasks were aborted");
        }
    }
}

/// Builds a [`SimulationSession`] from a registry and broker settings
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Registry,
    connection: ConnectionConfig,
    seed: Option<u64>,
    stop_timeout: Duration,
}

impl Orchestrator {
    #[must_use]
    pub fn new(registry: Registry, connection: ConnectionConfig) -> Self {
        Self {
            registry,
            connection,
            seed: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Fixes the master seed so every device replays the same values
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Connects to the broker, retrying per the startup policy, then starts
    /// every device
    ///
    /// # Errors
    ///
    /// Returns the `ConnectionError` if the broker stays unreachable; no
    /// device is started in that case
    pub async fn start(self) -> Result<SimulationSession<ConnectionManager>, ConnectionError> {
        let manager = Arc::new(ConnectionManager::new(self.connection));
        manager.connect().await?;

        let seed = self.seed.unwrap_or_else(rand::random);
        tracing::info!(devices = self.registry.len(), seed, "Starting simulation");
        Ok(SimulationSession::launch(&self.registry, manager, seed)
            .with_stop_timeout(self.stop_timeout))
    }
}

/// A running simulation: one task per device plus the shared publisher
pub struct SimulationSession<P: Publisher> {
    publisher: Arc<P>,
    shutdown: broadcast::Sender<()>,
    tasks: JoinSet<DeviceReport>,
    task_names: HashMap<Id, String>,
    order: Vec<String>,
    handles: Vec<DeviceHandle>,
    stop_timeout: Duration,
    started: Instant,
}

impl<P: Publisher> SimulationSession<P> {
    /// Spawns one simulator per profile. Device seeds are derived from
    /// `seed` in registry order.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(registry: &Registry, publisher: Arc<P>, seed: u64) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let mut seeds = StdRng::seed_from_u64(seed);
        let mut tasks = JoinSet::new();
        let mut task_names = HashMap::new();
        let mut handles = Vec::with_capacity(registry.len());

        for profile in registry {
            let device = DeviceSimulator::new(
                Arc::new(profile.clone()),
                Arc::clone(&publisher),
                seeds.random(),
            );
            handles.push(device.handle());
            let abort = tasks.spawn(device.run(shutdown.subscribe()));
            task_names.insert(abort.id(), profile.name.clone());
        }

        Self {
            publisher,
            shutdown,
            tasks,
            task_names,
            order: registry.iter().map(|p| p.name.clone()).collect(),
            handles,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            started: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    #[must_use]
    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn device_states(&self) -> Vec<(String, DeviceState)> {
        self.handles
            .iter()
            .map(|h| (h.name().to_string(), h.state()))
            .collect()
    }

    /// Resolves once every device has stopped on its own
    pub async fn wait_until_finished(&self) {
        let mut handles = self.handles.clone();
        for handle in &mut handles {
            handle.wait_for(DeviceState::Stopped).await;
        }
    }

    /// Stops every device and closes the publisher
    pub async fn stop(self) -> SessionReport {
        self.stop_with(StopReason::Requested, None).await
    }

    async fn stop_with(
        mut self,
        reason: StopReason,
        failure: Option<ConnectionError>,
    ) -> SessionReport {
        tracing::info!(?reason, "Stopping simulation");
        let _ = self.shutdown.send(());

        let deadline = Instant::now() + self.stop_timeout;
        let mut reports = HashMap::new();
        let mut aborted = Vec::new();

        loop {
            match timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(Ok((id, report)))) => {
                    self.task_names.remove(&id);
                    reports.insert(report.name.clone(), report);
                }
                Ok(Some(Err(e))) => {
                    let name = self.task_names.remove(&e.id()).unwrap_or_default();
                    tracing::error!(device = %name, error = %e, "Device task failed");
                    aborted.push(name);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        remaining = self.tasks.len(),
                        "Devices did not stop in time, aborting"
                    );
                    self.tasks.abort_all();
                    while let Some(result) = self.tasks.join_next_with_id().await {
                        match result {
                            Ok((id, report)) => {
                                self.task_names.remove(&id);
                                reports.insert(report.name.clone(), report);
                            }
                            Err(e) => {
                                aborted.push(self.task_names.remove(&e.id()).unwrap_or_default());
                            }
                        }
                    }
                    break;
                }
            }
        }

        self.publisher.close().await;

        let devices = self
            .order
            .iter()
            .filter_map(|name| reports.remove(name))
            .collect();
        aborted.sort_by_key(|name| self.order.iter().position(|n| n == name));

        let report = SessionReport {
            reason,
            elapsed: self.started.elapsed(),
            devices,
            aborted,
            connection: self.publisher.stats(),
            failure,
        };
        report.log();
        report
    }
}

impl SimulationSession<ConnectionManager> {
    /// Runs until Ctrl-C, until `duration` elapses, until the broker
    /// connection fails for good or until no device is left running, then
    /// stops the session
    pub async fn run_until_shutdown(self, duration: Option<Duration>) -> SessionReport {
        let manager = Arc::clone(&self.publisher);
        let elapsed = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let (reason, failure) = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
                (StopReason::Interrupted, None)
            }
            () = elapsed => (StopReason::DurationElapsed, None),
            err = manager.wait_until_failed() => {
                tracing::error!(error = %err, "Broker connection failed permanently");
                (StopReason::ConnectionFailed, Some(err))
            }
            () = self.wait_until_finished() => (StopReason::DevicesFinished, None),
        };
        self.stop_with(reason, failure).await
    }
}
