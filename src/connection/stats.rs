use crate::QoS;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery counters updated lock-free from every publishing task
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connects: AtomicU64,
    reconnects: AtomicU64,
    connect_failures: AtomicU64,
    published_qos0: AtomicU64,
    published_qos1: AtomicU64,
    acknowledged: AtomicU64,
    retransmissions: AtomicU64,
    ack_timeouts: AtomicU64,
    queued: AtomicU64,
    dropped_qos0: AtomicU64,
    dropped_qos1: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn record_connect(&self, reconnect: bool) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if reconnect {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, qos: QoS) {
        match qos {
            QoS::AtMostOnce => self.published_qos0.fetch_add(1, Ordering::Relaxed),
            QoS::AtLeastOnce => self.published_qos1.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a message lost to backpressure. `QoS` 1 losses are tracked
    /// separately because they break the delivery guarantee.
    pub(crate) fn record_dropped(&self, qos: QoS) {
        match qos {
            QoS::AtMostOnce => self.dropped_qos0.fetch_add(1, Ordering::Relaxed),
            QoS::AtLeastOnce => self.dropped_qos1.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            published_qos0: self.published_qos0.load(Ordering::Relaxed),
            published_qos1: self.published_qos1.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped_qos0: self.dropped_qos0.load(Ordering::Relaxed),
            dropped_qos1: self.dropped_qos1.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connects: u64,
    pub reconnects: u64,
    pub connect_failures: u64,
    pub published_qos0: u64,
    pub published_qos1: u64,
    pub acknowledged: u64,
    pub retransmissions: u64,
    pub ack_timeouts: u64,
    pub queued: u64,
    pub dropped_qos0: u64,
    pub dropped_qos1: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published_qos0 + self.published_qos1
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_qos0 + self.dropped_qos1
    }
}
