//! Per-device publish loop
//!
//! Each device runs as its own tokio task: sleep for `interval ± jitter`,
//! generate a payload, publish it through the shared [`Publisher`], repeat
//! until the shutdown broadcast arrives or no field has a value left.

use crate::connection::{Ack, OutboundMessage, Publisher};
use crate::generator::GeneratorState;
use crate::payload::{now_millis, Payload};
use crate::registry::DeviceProfile;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Lifecycle of one simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Idle,
    Running,
    /// Shutdown observed, in-flight publish finishing
    Stopping,
    Stopped,
}

/// Counters for one device, returned when its loop ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub ticks: u64,
    /// Sent (`QoS` 0) or acknowledged (`QoS` 1)
    pub published: u64,
    /// Accepted into the offline queue while the broker was away
    pub queued: u64,
    pub failed: u64,
    /// Stopped because every field ran out of values
    pub exhausted: bool,
}

/// Read-only view of a running device
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    name: String,
    state: watch::Receiver<DeviceState>,
}

impl DeviceHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Waits until the device reaches `target`
    pub async fn wait_for(&mut self, target: DeviceState) {
        let _ = self.state.wait_for(|state| *state == target).await;
    }
}

/// Drives one [`DeviceProfile`]
///
/// Owns its generator states and random source exclusively; only the
/// publisher is shared with other devices.
pub struct DeviceSimulator<P: Publisher> {
    profile: Arc<DeviceProfile>,
    publisher: Arc<P>,
    rng: StdRng,
    generators: Vec<GeneratorState>,
    state: watch::Sender<DeviceState>,
    report: DeviceReport,
}

impl<P: Publisher> DeviceSimulator<P> {
    /// Creates an idle simulator. The same `seed` reproduces the same values
    /// and tick delays.
    pub fn new(profile: Arc<DeviceProfile>, publisher: Arc<P>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let generators = profile
            .fields
            .iter()
            .map(|field| field.generator.initial_state(&mut rng))
            .collect();
        let (state, _) = watch::channel(DeviceState::Idle);
        let report = DeviceReport {
            name: profile.name.clone(),
            ..DeviceReport::default()
        };
        Self {
            profile,
            publisher,
            rng,
            generators,
            state,
            report,
        }
    }

    #[must_use]
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            name: self.profile.name.clone(),
            state: self.state.subscribe(),
        }
    }

    #[must_use]
    pub fn report(&self) -> &DeviceReport {
        &self.report
    }

    fn set_state(&self, next: DeviceState) {
        tracing::trace!(device = %self.profile.name, state = ?next, "Device state changed");
        self.state.send_replace(next);
    }

    /// True once no field generator has a value left
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        !self
            .profile
            .fields
            .iter()
            .zip(&self.generators)
            .any(|(field, state)| field.generator.is_active(state))
    }

    /// Advances every active field generator once and assembles the payload.
    /// Inactive fields are left out.
    pub fn build_payload(&mut self) -> Payload {
        let fields = self
            .profile
            .fields
            .iter()
            .zip(self.generators.iter_mut())
            .filter(|(field, state)| field.generator.is_active(state))
            .map(|(field, state)| {
                let (value, next) = field.generator.next(state, &mut self.rng);
                *state = next;
                (field.name.clone(), value)
            })
            .collect();
        Payload::new(
            self.profile.name.clone(),
            now_millis(),
            self.profile.payload_root.clone(),
            fields,
        )
    }

    /// Generates and publishes one message. Failures are logged and counted;
    /// they never end the device loop. Does nothing once the device is
    /// exhausted.
    pub async fn tick(&mut self) {
        if self.is_exhausted() {
            return;
        }
        self.report.ticks += 1;
        let payload = self.build_payload();
        let device = self.profile.name.as_str();
        let topic = self.profile.topic.as_str();

        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report.failed += 1;
                tracing::warn!(%device, %topic, error = %e, "Failed to encode payload");
                return;
            }
        };
        tracing::debug!(
            %device,
            %topic,
            payload = %String::from_utf8_lossy(&bytes),
            "Publishing"
        );

        let message = OutboundMessage::new(topic, bytes, self.profile.qos)
            .with_retain(self.profile.retain);
        match self.publisher.publish_message(message).await {
            Ok(Ack::Sent | Ack::Acknowledged { .. }) => self.report.published += 1,
            Ok(Ack::Queued) => self.report.queued += 1,
            Err(e) => {
                self.report.failed += 1;
                tracing::warn!(%device, %topic, error = %e, "Publish failed");
            }
        }
    }

    /// Runs the tick loop until `shutdown` fires or every field is
    /// exhausted, then returns the report
    ///
    /// The signal is observed both while sleeping between ticks and while a
    /// publish is in progress. In the latter case the device reports
    /// [`DeviceState::Stopping`] until that publish finishes.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> DeviceReport {
        self.set_state(DeviceState::Running);
        tracing::debug!(
            device = %self.profile.name,
            topic = %self.profile.topic,
            interval = ?self.profile.interval.base,
            "Device started"
        );

        let state = self.state.clone();
        let profile = Arc::clone(&self.profile);
        loop {
            if self.is_exhausted() {
                self.report.exhausted = true;
                tracing::info!(device = %profile.name, "No active fields left, stopping device");
                break;
            }
            let delay = self.profile.interval.sample(&mut self.rng);
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            tokio::select! {
                biased;
                () = &mut tick => {}
                _ = shutdown.recv() => {
                    state.send_replace(DeviceState::Stopping);
                    tracing::debug!(device = %profile.name, "Shutdown during publish, finishing it");
                    tick.await;
                    break;
                }
            }
        }

        self.set_state(DeviceState::Stopping);
        tracing::debug!(
            device = %self.profile.name,
            ticks = self.report.ticks,
            "Device stopped"
        );
        self.set_state(DeviceState::Stopped);
        self.report
    }
}
