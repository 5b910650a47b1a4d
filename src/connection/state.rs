use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle of the shared broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Publishes are accepted into the offline queue in this state
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Inputs that drive [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `connect()` was called on an idle manager
    ConnectRequested,
    /// CONNACK accepted
    Established,
    /// Transport failed, keep alive expired or the broker disconnected us
    Lost,
    /// A connect attempt failed; `exhausted` once no attempts remain
    AttemptFailed { exhausted: bool },
    /// Local shutdown
    Closed,
}

/// Returns the state reached by applying `event`, or `None` if the event is
/// not valid in `state`
#[must_use]
pub fn transition(state: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (_, E::Closed) => Some(S::Disconnected),
        (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, E::Established) => Some(S::Connected),
        (S::Connected, E::Lost) => Some(S::Reconnecting),
        (S::Connecting | S::Reconnecting, E::AttemptFailed { exhausted: false }) => Some(state),
        (S::Connecting | S::Reconnecting, E::AttemptFailed { exhausted: true }) => {
            Some(S::Disconnected)
        }
        _ => None,
    }
}

/// Reconnection behavior after a lost connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    #[serde(serialize_with = "super::serialize_secs")]
    pub initial_delay: Duration,
    /// Cap for the exponential delay
    #[serde(serialize_with = "super::serialize_secs")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]`
    pub jitter: f64,
    /// Maximum number of reconnection attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Give up once reconnection has been going on for this long
    #[serde(serialize_with = "super::serialize_opt_secs")]
    pub max_total_wait: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
            max_total_wait: None,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_max_total_wait(mut self, wait: Option<Duration>) -> Self {
        self.max_total_wait = wait;
        self
    }
}

/// Exponential backoff with a cap and proportional jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay.max(config.initial_delay),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delays handed out so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the given zero-based attempt
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Returns the next delay and advances the attempt counter
    ///
    /// The jittered delay lies in `[base * (1 - jitter), base]`, so it never
    /// exceeds the configured cap.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 - self.jitter * rng.random::<f64>();
        base.mul_f64(factor)
    }
}
