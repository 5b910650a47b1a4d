use crate::connection::OutboundMessage;
use crate::error::PublishError;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// What happens when a publish arrives at a full offline queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Reject the incoming message
    DropNewest,
}

impl FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            other => Err(format!(
                "unknown drop policy `{other}` (expected drop_oldest or drop_newest)"
            )),
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropOldest => f.write_str("drop_oldest"),
            Self::DropNewest => f.write_str("drop_newest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueConfig {
    /// Messages held while the connection is down; 0 disables queueing
    pub depth: usize,
    pub drop_policy: DropPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 1000,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn new(depth: usize, drop_policy: DropPolicy) -> Self {
        Self { depth, drop_policy }
    }
}

/// Result of a successful [`OfflineQueue::push`]
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    Stored,
    /// Stored after evicting this older message
    Evicted(OutboundMessage),
}

/// Bounded FIFO of messages published while the broker is unreachable
#[derive(Debug)]
pub struct OfflineQueue {
    config: QueueConfig,
    messages: VecDeque<OutboundMessage>,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            messages: VecDeque::with_capacity(config.depth.min(1024)),
        }
    }

    /// Queues a message, applying the drop policy when full
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Backpressure` carrying the rejected message's
    /// `QoS` when the message cannot be stored
    pub fn push(&mut self, message: OutboundMessage) -> Result<Enqueued, PublishError> {
        if self.config.depth == 0 {
            return Err(PublishError::Backpressure {
                depth: 0,
                qos: message.qos,
            });
        }

        if self.messages.len() < self.config.depth {
            self.messages.push_back(message);
            return Ok(Enqueued::Stored);
        }

        match self.config.drop_policy {
            DropPolicy::DropNewest => Err(PublishError::Backpressure {
                depth: self.config.depth,
                qos: message.qos,
            }),
            DropPolicy::DropOldest => {
                let evicted = self.messages.pop_front();
                self.messages.push_back(message);
                Ok(evicted.map_or(Enqueued::Stored, Enqueued::Evicted))
            }
        }
    }

    /// Puts a message back at the head, used when an in-flight send is
    /// interrupted by a lost connection. Ignores the depth bound so a
    /// requeue never loses the message.
    pub fn push_front(&mut self, message: OutboundMessage) {
        self.messages.push_front(message);
    }

    pub fn pop(&mut self) -> Option<OutboundMessage> {
        self.messages.pop_front()
    }

    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.messages.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn config(&self) -> QueueConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QoS;

    fn msg(n: u8, qos: QoS) -> OutboundMessage {
        OutboundMessage::new(format!("dev/{n}"), vec![n], qos)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = OfflineQueue::new(QueueConfig::new(3, DropPolicy::DropOldest));
        for n in 0..3 {
            assert_eq!(queue.push(msg(n, QoS::AtMostOnce)).unwrap(), Enqueued::Stored);
        }
        assert_eq!(queue.len(), 3);
        let topics: Vec<_> = queue.drain().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["dev/0", "dev/1", "dev/2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_oldest_evicts_head() {
        let mut queue = OfflineQueue::new(QueueConfig::new(2, DropPolicy::DropOldest));
        queue.push(msg(0, QoS::AtLeastOnce)).unwrap();
        queue.push(msg(1, QoS::AtMostOnce)).unwrap();

        match queue.push(msg(2, QoS::AtMostOnce)).unwrap() {
            Enqueued::Evicted(old) => {
                assert_eq!(old.topic, "dev/0");
                assert_eq!(old.qos, QoS::AtLeastOnce);
            }
            Enqueued::Stored => panic!("expected eviction"),
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().topic, "dev/1");
    }

    #[test]
    fn test_drop_newest_rejects() {
        let mut queue = OfflineQueue::new(QueueConfig::new(1, DropPolicy::DropNewest));
        queue.push(msg(0, QoS::AtMostOnce)).unwrap();
        let err = queue.push(msg(1, QoS::AtLeastOnce)).unwrap_err();
        assert_eq!(
            err,
            PublishError::Backpressure {
                depth: 1,
                qos: QoS::AtLeastOnce
            }
        );
        assert_eq!(queue.pop().unwrap().topic, "dev/0");
    }

    #[test]
    fn test_zero_depth_always_rejects() {
        let mut queue = OfflineQueue::new(QueueConfig::new(0, DropPolicy::DropOldest));
        assert!(matches!(
            queue.push(msg(0, QoS::AtMostOnce)),
            Err(PublishError::Backpressure { depth: 0, .. })
        ));
    }

    #[test]
    fn test_push_front_ignores_bound() {
        let mut queue = OfflineQueue::new(QueueConfig::new(1, DropPolicy::DropNewest));
        queue.push(msg(1, QoS::AtLeastOnce)).unwrap();
        queue.push_front(msg(0, QoS::AtLeastOnce));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().topic, "dev/0");
    }

    #[test]
    fn test_drop_policy_parse() {
        assert_eq!("drop_oldest".parse::<DropPolicy>(), Ok(DropPolicy::DropOldest));
        assert_eq!("drop_newest".parse::<DropPolicy>(), Ok(DropPolicy::DropNewest));
        assert!("drop_random".parse::<DropPolicy>().is_err());
        assert_eq!(DropPolicy::DropNewest.to_string(), "drop_newest");
    }
}
