//! Mock publisher for testing
//!
//! Records every call so device and orchestrator behavior can be verified
//! without a broker.

use crate::connection::{Ack, OutboundMessage, Publisher, StatsSnapshot};
use crate::error::PublishError;
use crate::QoS;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Record of a call made to the mock publisher
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Publish(OutboundMessage),
    Close,
}

/// In-memory [`Publisher`] that records calls and replays scripted failures
#[derive(Clone, Default)]
pub struct MockPublisher {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    closed: AtomicBool,
    packet_id_counter: AtomicU16,
    calls: Mutex<Vec<MockCall>>,
    /// Consumed front to back, one per publish, before the default behavior
    scripted: Mutex<VecDeque<Result<Ack, PublishError>>>,
    /// How long each publish takes to resolve once recorded
    latency: Mutex<Duration>,
}

impl MockPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets all recorded calls
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().await.clone()
    }

    /// Gets the recorded publishes, in call order
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state
            .calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                MockCall::Publish(message) => Some(message.clone()),
                MockCall::Close => None,
            })
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.calls.lock().await.clear();
    }

    /// Queues the outcome of the next publish call
    pub async fn push_response(&self, response: Result<Ack, PublishError>) {
        self.state.scripted.lock().await.push_back(response);
    }

    /// Makes the next `count` publishes fail with `error`
    pub async fn fail_next(&self, count: usize, error: PublishError) {
        let mut scripted = self.state.scripted.lock().await;
        scripted.extend(std::iter::repeat_n(Err(error), count));
    }

    /// Delays every later publish result, as a slow broker would
    pub async fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().await = latency;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn next_packet_id(&self) -> u16 {
        self.state
            .packet_id_counter
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
            .max(1)
    }
}

impl Publisher for MockPublisher {
    fn publish_message(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<Ack, PublishError>> + Send + '_ {
        async move {
            if self.is_closed() {
                return Err(PublishError::Closed);
            }
            let qos = message.qos;
            self.state
                .calls
                .lock()
                .await
                .push(MockCall::Publish(message));

            let latency = *self.state.latency.lock().await;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if let Some(response) = self.state.scripted.lock().await.pop_front() {
                return response;
            }
            Ok(match qos {
                QoS::AtMostOnce => Ack::Sent,
                QoS::AtLeastOnce => Ack::Acknowledged {
                    packet_id: self.next_packet_id(),
                },
            })
        }
    }

    fn close(&self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            self.state.closed.store(true, Ordering::SeqCst);
            self.state.calls.lock().await.push(MockCall::Close);
        }
    }

    fn stats(&self) -> Option<StatsSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_publishes() {
        let mock = MockPublisher::new();
        let ack = mock
            .publish_message(OutboundMessage::new("a/1", &b"1"[..], QoS::AtMostOnce))
            .await
            .unwrap();
        assert_eq!(ack, Ack::Sent);
        let ack = mock
            .publish_message(OutboundMessage::new("a/2", &b"2"[..], QoS::AtLeastOnce))
            .await
            .unwrap();
        assert_eq!(ack, Ack::Acknowledged { packet_id: 1 });

        let topics: Vec<_> = mock.published().await.into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let mock = MockPublisher::new();
        mock.fail_next(2, PublishError::NotConnected).await;

        for _ in 0..2 {
            let err = mock
                .publish_message(OutboundMessage::new("a", &b""[..], QoS::AtMostOnce))
                .await
                .unwrap_err();
            assert_eq!(err, PublishError::NotConnected);
        }
        assert!(mock
            .publish_message(OutboundMessage::new("a", &b""[..], QoS::AtMostOnce))
            .await
            .is_ok());
        assert_eq!(mock.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_mock_close() {
        let mock = MockPublisher::new();
        mock.close().await;
        assert!(mock.is_closed());
        assert_eq!(mock.calls().await, vec![MockCall::Close]);
        assert_eq!(
            mock.publish_message(OutboundMessage::new("a", &b""[..], QoS::AtMostOnce))
                .await,
            Err(PublishError::Closed)
        );
    }
}
