mod common;

use common::{FakeBroker, DEFAULT_TIMEOUT};
use mqtt_device_sim::{
    Ack, ConnectionError, ConnectionManager, ConnectionState, DropPolicy, ProtocolVersion,
    PublishError, QoS, QueueConfig, ReconnectConfig,
};
use std::time::Duration;
use tokio::time::timeout;

async fn wait_for_state(manager: &ConnectionManager, target: ConnectionState) {
    let mut state = manager.subscribe_state();
    timeout(DEFAULT_TIMEOUT, state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("never reached {target}"))
        .unwrap();
}

async fn wait_until<F: Fn() -> bool>(check: F) {
    timeout(DEFAULT_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_connect_and_publish_both_qos_levels() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(broker.config("publish"));

    manager.connect().await.unwrap();
    assert!(manager.is_connected());

    let sent = manager
        .publish("lamp/1", &b"{\"on\":true}"[..], QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(sent, Ack::Sent);

    let acked = manager
        .publish("air_quality", &b"{\"alert\":false}"[..], QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(acked, Ack::Acknowledged { .. }));

    let publishes = broker.wait_for_publishes(2).await;
    assert_eq!(publishes[0].topic_name, "lamp/1");
    assert_eq!(publishes[0].qos, QoS::AtMostOnce);
    assert_eq!(publishes[1].topic_name, "air_quality");
    assert!(publishes[1].packet_id.is_some());
    assert!(!publishes[1].dup);

    let stats = manager.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.published(), 2);
    assert_eq!(stats.acknowledged, 1);

    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    wait_for_disconnect(&broker).await;
}

async fn wait_for_disconnect(broker: &FakeBroker) {
    timeout(DEFAULT_TIMEOUT, async {
        while broker.disconnects().await == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_mqtt_311_session() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("v311")
            .with_protocol_version(ProtocolVersion::V311),
    );
    manager.connect().await.unwrap();
    let ack = manager
        .publish("sensors/t", &b"{}"[..], QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(ack, Ack::Acknowledged { .. }));
    assert_eq!(broker.versions().await, vec![ProtocolVersion::V311]);
    manager.close().await;
}

#[tokio::test]
async fn test_refused_connack_exhausts_startup_attempts() {
    let broker = FakeBroker::start().await;
    broker.set_connack_code(0x87).await;
    let manager = ConnectionManager::new(broker.config("refused"));

    let err = manager.connect().await.unwrap_err();
    match err {
        ConnectionError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(*last, ConnectionError::Refused(0x87));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(broker.connections().await, 3);
    assert_eq!(manager.stats().connect_failures, 3);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unacknowledged_publish_is_retransmitted_then_fails() {
    let broker = FakeBroker::start().await;
    broker.set_ack_publishes(false).await;
    let manager = ConnectionManager::new(broker.config("no-ack"));
    manager.connect().await.unwrap();

    let err = manager
        .publish("plant/tank", &b"{}"[..], QoS::AtLeastOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::AckTimeout { attempts: 4, .. }));

    let publishes = broker.wait_for_publishes(4).await;
    assert!(!publishes[0].dup);
    assert!(publishes[1..].iter().all(|p| p.dup));
    assert!(publishes
        .iter()
        .all(|p| p.packet_id == publishes[0].packet_id));
    let stats = manager.stats();
    assert_eq!(stats.retransmissions, 3);
    assert_eq!(stats.ack_timeouts, 1);
    // DUP copies are retransmissions, not new publishes
    assert_eq!(stats.published_qos1, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_negative_puback_is_rejected() {
    let broker = FakeBroker::start().await;
    broker.set_puback_code(0x87).await;
    let manager = ConnectionManager::new(broker.config("rejected"));
    manager.connect().await.unwrap();

    let err = manager
        .publish("plant/tank", &b"{}"[..], QoS::AtLeastOnce)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Rejected {
            reason_code: 0x87,
            ..
        }
    ));
    manager.close().await;
}

#[tokio::test]
async fn test_qos_ceiling_downgrades_publish() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(broker.config("ceiling").with_qos_ceiling(QoS::AtMostOnce));
    manager.connect().await.unwrap();

    let ack = manager
        .publish("lamp/1", &b"{}"[..], QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(ack, Ack::Sent);
    let publishes = broker.wait_for_publishes(1).await;
    assert_eq!(publishes[0].qos, QoS::AtMostOnce);
    manager.close().await;
}

#[tokio::test]
async fn test_reconnects_after_broker_drop() {
    common::init_tracing();
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(broker.config("reconnect"));
    manager.connect().await.unwrap();
    broker.wait_for_connections(1).await;

    broker.drop_connections().await;
    broker.wait_for_connections(2).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    let stats = manager.clone();
    wait_until(move || stats.stats().reconnects == 1).await;

    let ack = manager
        .publish("lamp/1", &b"{}"[..], QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(ack, Ack::Acknowledged { .. }));
    assert_eq!(manager.stats().connects, 2);
    manager.close().await;
}

#[tokio::test]
async fn test_publishes_during_outage_are_queued_and_flushed() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(broker.config("queued"));
    manager.connect().await.unwrap();

    broker.set_accepting(false).await;
    broker.drop_connections().await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    for i in 0..3 {
        let ack = manager
            .publish(format!("lamp/{i}"), &b"{}"[..], QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(ack, Ack::Queued);
    }
    assert_eq!(manager.queued().await, 3);

    broker.set_accepting(true).await;
    let publishes = broker.wait_for_publishes(3).await;
    let topics: Vec<_> = publishes.iter().map(|p| p.topic_name.as_str()).collect();
    assert_eq!(topics, vec!["lamp/0", "lamp/1", "lamp/2"]);
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(manager.queued().await, 0);
    assert_eq!(manager.stats().queued, 3);
    manager.close().await;
}

#[tokio::test]
async fn test_backpressure_drop_oldest_counts_qos1_loss() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("drop-oldest")
            .with_queue(QueueConfig::new(2, DropPolicy::DropOldest)),
    );
    manager.connect().await.unwrap();

    broker.set_accepting(false).await;
    broker.drop_connections().await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    for i in 0..3 {
        let ack = manager
            .publish(format!("m/{i}"), &b"{}"[..], QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(ack, Ack::Queued);
    }
    let stats = manager.stats();
    assert_eq!(stats.dropped_qos1, 1);
    assert_eq!(stats.dropped_qos0, 0);

    broker.set_accepting(true).await;
    let publishes = broker.wait_for_publishes(2).await;
    let topics: Vec<_> = publishes.iter().map(|p| p.topic_name.as_str()).collect();
    assert_eq!(topics, vec!["m/1", "m/2"]);
    manager.close().await;
}

#[tokio::test]
async fn test_backpressure_drop_newest_rejects_publish() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("drop-newest")
            .with_queue(QueueConfig::new(1, DropPolicy::DropNewest)),
    );
    manager.connect().await.unwrap();

    broker.set_accepting(false).await;
    broker.drop_connections().await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;

    assert_eq!(
        manager.publish("m/0", &b"{}"[..], QoS::AtMostOnce).await,
        Ok(Ack::Queued)
    );
    let err = manager
        .publish("m/1", &b"{}"[..], QoS::AtMostOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Backpressure { depth: 1, .. }));
    assert_eq!(manager.stats().dropped_qos0, 1);
    manager.close().await;
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    common::init_tracing();
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker.config("give-up").with_reconnect(
            ReconnectConfig::default()
                .with_delays(Duration::from_millis(10), Duration::from_millis(20))
                .with_jitter(0.0)
                .with_max_attempts(2),
        ),
    );
    manager.connect().await.unwrap();

    broker.set_accepting(false).await;
    broker.drop_connections().await;

    let err = timeout(DEFAULT_TIMEOUT, manager.wait_until_failed())
        .await
        .unwrap();
    assert!(matches!(
        err,
        ConnectionError::RetriesExhausted { attempts: 2, .. }
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.publish("m", &b"{}"[..], QoS::AtMostOnce).await,
        Err(PublishError::NotConnected)
    );
}

#[tokio::test]
async fn test_keep_alive_sends_pingreq() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("keep-alive")
            .with_keep_alive(Duration::from_secs(1)),
    );
    manager.connect().await.unwrap();

    broker.wait_for_pings(2).await;
    assert!(manager.is_connected());
    assert_eq!(manager.stats().reconnects, 0);
    manager.close().await;
}

#[tokio::test]
async fn test_partial_keep_alive_is_declared_rounded_up() {
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("keep-alive-rounding")
            .with_keep_alive(Duration::from_millis(500)),
    );
    manager.connect().await.unwrap();
    assert_eq!(broker.keep_alives().await, vec![1]);

    // Pings follow the declared period, never the unrounded one
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(broker.pings().await, 0);
    broker.wait_for_pings(1).await;
    manager.close().await;
}

#[tokio::test]
async fn test_unanswered_pingreq_triggers_reconnect() {
    common::init_tracing();
    let broker = FakeBroker::start().await;
    let manager = ConnectionManager::new(
        broker
            .config("ping-timeout")
            .with_keep_alive(Duration::from_secs(1)),
    );
    manager.connect().await.unwrap();

    broker.set_answer_pings(false).await;
    broker.set_accepting(false).await;
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    assert!(broker.pings().await >= 1);

    broker.set_answer_pings(true).await;
    broker.set_accepting(true).await;
    wait_for_state(&manager, ConnectionState::Connected).await;
    let stats = manager.clone();
    wait_until(move || stats.stats().reconnects == 1).await;
    manager.close().await;
}
