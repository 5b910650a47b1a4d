//! The shared broker session
//!
//! CRITICAL: NO EVENT LOOPS
//! Publishing is a direct async call. Background tasks only read acks,
//! send keep alive pings and run the reconnect supervisor.

use crate::connection::queue::{Enqueued, OfflineQueue};
use crate::connection::state::{transition, Backoff, ConnectionEvent, ConnectionState};
use crate::connection::stats::{ConnectionStats, StatsSnapshot};
use crate::connection::{Ack, ConnectionConfig, OutboundMessage, Publisher};
use crate::error::{ConnectionError, MqttError, PublishError};
use crate::packet::connect::keep_alive_secs;
use crate::packet::{ConnectPacket, DisconnectPacket, Packet, PublishPacket};
use crate::packet_id::PacketIdGenerator;
use crate::transport::{
    PacketReader, PacketWriter, TcpConfig, TcpTransport, TlsConfig, TlsTransport, Transport,
    TransportReader, TransportType, TransportWriter,
};
use crate::QoS;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

/// Upper bound for the best-effort DISCONNECT and socket shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Write half of the live connection, tagged with the connection it
/// belongs to so stale tasks cannot act on a newer one
struct ActiveWriter {
    generation: u64,
    writer: TransportWriter,
}

/// A publish that made it onto the wire
enum Sent {
    AtMostOnce,
    AtLeastOnce {
        packet_id: u16,
        ack: oneshot::Receiver<u8>,
    },
}

struct Inner {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    /// Single serialization point for every write to the transport
    writer: Mutex<Option<ActiveWriter>>,
    /// `QoS` 1 publishes waiting for PUBACK, keyed by packet id
    pending: Mutex<HashMap<u16, oneshot::Sender<u8>>>,
    queue: Mutex<OfflineQueue>,
    packet_ids: PacketIdGenerator,
    stats: ConnectionStats,
    generation: AtomicU64,
    ping_outstanding: AtomicBool,
    closed: AtomicBool,
    lost_tx: mpsc::UnboundedSender<(u64, String)>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, String)>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    fatal: Mutex<Option<ConnectionError>>,
}

impl Inner {
    /// Reports that connection `generation` is no longer usable. Handled by
    /// the supervisor task; stale generations are ignored there.
    fn signal_lost(&self, generation: u64, reason: impl Into<String>) {
        let _ = self.lost_tx.send((generation, reason.into()));
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Owns the broker session shared by all device simulators
///
/// Cloning is cheap and every clone drives the same session. Call
/// [`ConnectionManager::close`] when done; background tasks keep the
/// session alive until then.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.inner.config.broker_address())
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let queue = OfflineQueue::new(config.queue);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                queue: Mutex::new(queue),
                packet_ids: PacketIdGenerator::new(),
                stats: ConnectionStats::default(),
                generation: AtomicU64::new(0),
                ping_outstanding: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                lost_tx,
                lost_rx: Mutex::new(Some(lost_rx)),
                conn_tasks: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
                fatal: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watches state changes, e.g. to wait for a reconnect
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Messages currently held in the offline queue
    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Applies a state machine event, returning whether the state changed
    fn apply(&self, event: ConnectionEvent) -> bool {
        self.inner.state.send_if_modified(|state| {
            match transition(*state, event) {
                Some(next) if next != *state => {
                    tracing::debug!(from = %state, to = %next, "Connection state changed");
                    *state = next;
                    true
                }
                _ => false,
            }
        })
    }

    /// Connects to the broker, retrying with backoff up to
    /// `startup_attempts` times
    ///
    /// On success the reconnect supervisor is started, so later connection
    /// losses are handled in the background.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::RetriesExhausted` with the last failure when
    /// every attempt fails, or `ConnectionError::Closed` after `close()`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        if !self.apply(ConnectionEvent::ConnectRequested) {
            return Err(ConnectionError::Transport(MqttError::AlreadyConnected));
        }

        let broker = self.inner.config.broker_address();
        let max_attempts = self.inner.config.startup_attempts.max(1);
        let mut backoff = Backoff::new(&self.inner.config.reconnect);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.establish(false).await {
                Ok(()) => match self.flush_queue().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.teardown().await;
                        Err(ConnectionError::from(e))
                    }
                },
                Err(e) => Err(e),
            };
            let err = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            self.inner.stats.record_connect_failure();
            if attempt >= max_attempts {
                tracing::error!(%broker, attempts = attempt, error = %err, "Broker unreachable, giving up");
                self.fail_pending(ConnectionEvent::AttemptFailed { exhausted: true })
                    .await;
                return Err(ConnectionError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = backoff.next_delay(&mut rand::rng());
            tracing::warn!(
                %broker,
                attempt,
                max_attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Broker unreachable, retrying"
            );
            sleep(delay).await;
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(ConnectionError::Closed);
            }
        }

        if let Some(lost_rx) = self.inner.lost_rx.lock().await.take() {
            let handle = tokio::spawn(self.clone().supervise(lost_rx));
            *self.inner.supervisor.lock().await = Some(handle);
        }
        Ok(())
    }

    /// One connection attempt: transport, CONNECT, CONNACK, background tasks
    async fn establish(&self, reconnect: bool) -> Result<(), ConnectionError> {
        let config = &self.inner.config;
        let version = config.protocol_version;
        let broker = config.broker_address();

        let addr = tokio::net::lookup_host(&broker)
            .await
            .map_err(|e| ConnectionError::Resolve(format!("{broker}: {e}")))?
            .next()
            .ok_or_else(|| ConnectionError::Resolve(broker.clone()))?;

        let mut transport = self.build_transport(addr)?;
        let secure = transport.is_secure();
        transport.connect().await?;
        let (mut reader, mut writer) = transport.into_split()?;

        let mut connect = ConnectPacket::new(config.client_id.clone(), version)
            .with_keep_alive(config.keep_alive)
            .with_clean_start(config.clean_session);
        if let Some(username) = &config.username {
            connect = connect.with_credentials(
                username.clone(),
                config.password.as_ref().map(|p| p.as_bytes().to_vec()),
            );
        }
        writer
            .write_packet(&Packet::Connect(Box::new(connect)), version)
            .await?;

        let packet = timeout(config.connect_timeout, reader.read_packet(version))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        let session_present = match packet {
            Packet::ConnAck(ack) if ack.is_success() => ack.session_present,
            Packet::ConnAck(ack) => return Err(ConnectionError::Refused(ack.return_code)),
            other => {
                return Err(ConnectionError::Transport(MqttError::ProtocolError(format!(
                    "expected CONNACK, got {:?}",
                    other.packet_type()
                ))))
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.ping_outstanding.store(false, Ordering::Release);
        *self.inner.writer.lock().await = Some(ActiveWriter { generation, writer });

        let read_task = tokio::spawn(read_loop(Arc::clone(&self.inner), reader, generation));
        let keepalive_task = tokio::spawn(keepalive_loop(Arc::clone(&self.inner), generation));
        {
            let mut tasks = self.inner.conn_tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
            tasks.push(read_task);
            tasks.push(keepalive_task);
        }

        self.inner.stats.record_connect(reconnect);
        tracing::info!(
            %broker,
            client_id = %config.client_id,
            tls = secure,
            session_present,
            "Connected to broker"
        );
        Ok(())
    }

    /// Builds a fresh transport; certificate files are re-read on every
    /// attempt so rotated credentials are picked up on reconnect
    fn build_transport(&self, addr: SocketAddr) -> Result<TransportType, ConnectionError> {
        let config = &self.inner.config;
        let Some(paths) = &config.tls else {
            let tcp = TcpConfig::new(addr).with_connect_timeout(config.connect_timeout);
            return Ok(TransportType::Tcp(TcpTransport::new(tcp)));
        };

        let hostname = paths
            .server_name
            .clone()
            .unwrap_or_else(|| config.host.clone());
        let mut tls = TlsConfig::new(addr, hostname)
            .with_connect_timeout(config.connect_timeout)
            .with_verify_server_cert(paths.verify_server_cert);
        if let Some(ca) = &paths.ca_certs {
            tls.load_ca_cert_pem(ca)?;
            tls = tls.with_system_roots(false);
        }
        match (&paths.client_cert, &paths.client_key) {
            (Some(cert), Some(key)) => {
                tls.load_client_cert_pem(cert)?;
                tls.load_client_key_pem(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ConnectionError::Tls(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        }
        Ok(TransportType::Tls(Box::new(TlsTransport::new(tls))))
    }

    /// Handles connection loss signals for the lifetime of the session
    async fn supervise(self, mut lost_rx: mpsc::UnboundedReceiver<(u64, String)>) {
        let broker = self.inner.config.broker_address();
        while let Some((generation, reason)) = lost_rx.recv().await {
            if self.inner.closed.load(Ordering::Acquire)
                || generation != self.inner.current_generation()
            {
                continue;
            }
            {
                let _queue = self.inner.queue.lock().await;
                if !self.apply(ConnectionEvent::Lost) {
                    continue;
                }
            }
            tracing::warn!(%broker, %reason, "Connection lost, reconnecting");
            self.teardown().await;

            match self.reconnect().await {
                Ok(()) => {}
                Err(ConnectionError::Closed) => return,
                Err(err) => {
                    tracing::error!(%broker, error = %err, "Giving up on broker connection");
                    *self.inner.fatal.lock().await = Some(err);
                    self.fail_pending(ConnectionEvent::AttemptFailed { exhausted: true })
                        .await;
                    return;
                }
            }
        }
    }

    /// Retries `establish` with backoff until it succeeds or the reconnect
    /// limits are hit
    async fn reconnect(&self) -> Result<(), ConnectionError> {
        let config = &self.inner.config.reconnect;
        let mut backoff = Backoff::new(config);
        let started = Instant::now();

        loop {
            let delay = backoff.next_delay(&mut rand::rng());
            if let Some(max_wait) = config.max_total_wait {
                if started.elapsed() + delay > max_wait {
                    return Err(ConnectionError::MaxWaitExceeded(max_wait));
                }
            }
            let attempt = backoff.attempts();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling reconnect attempt"
            );
            sleep(delay).await;
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(ConnectionError::Closed);
            }

            let result = match self.establish(true).await {
                Ok(()) => match self.flush_queue().await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        self.teardown().await;
                        ConnectionError::from(e)
                    }
                },
                Err(e) => e,
            };

            self.inner.stats.record_connect_failure();
            self.apply(ConnectionEvent::AttemptFailed { exhausted: false });
            tracing::warn!(attempt, error = %result, "Reconnect attempt failed");
            if config.max_attempts != 0 && attempt >= config.max_attempts {
                return Err(ConnectionError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(result),
                });
            }
        }
    }

    /// Sends everything queued while offline, in order, then marks the
    /// session connected. Holding the queue lock throughout keeps new
    /// publishes behind the backlog.
    async fn flush_queue(&self) -> Result<(), MqttError> {
        let mut queue = self.inner.queue.lock().await;
        let mut flushed = 0usize;

        while let Some(message) = queue.pop() {
            let mut slot = self.inner.writer.lock().await;
            match self.send_publish(&mut slot, &message, None).await {
                Ok(Sent::AtMostOnce) => {}
                Ok(Sent::AtLeastOnce { packet_id, ack }) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let topic = message.topic.clone();
                        if let Err(e) = this.await_ack(message, packet_id, ack).await {
                            tracing::warn!(%topic, error = %e, "Queued publish was not acknowledged");
                        }
                    });
                }
                Err(e) => {
                    queue.push_front(message);
                    return Err(e);
                }
            }
            flushed += 1;
        }

        self.apply(ConnectionEvent::Established);
        drop(queue);
        if flushed > 0 {
            tracing::info!(flushed, "Flushed offline queue");
        }
        Ok(())
    }

    /// Drops the current connection: writer, background tasks and in-flight
    /// ack waiters, which requeue their messages
    async fn teardown(&self) {
        let taken = self.inner.writer.lock().await.take();
        if let Some(mut active) = taken {
            let _ = timeout(SHUTDOWN_GRACE, active.writer.shutdown()).await;
        }
        for task in self.inner.conn_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.pending.lock().await.clear();
    }

    /// Moves to `Disconnected` and discards the offline queue
    async fn fail_pending(&self, event: ConnectionEvent) {
        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            self.apply(event);
            queue.drain()
        };
        self.record_discarded(&dropped);
    }

    fn record_discarded(&self, dropped: &[OutboundMessage]) {
        if dropped.is_empty() {
            return;
        }
        for message in dropped {
            self.inner.stats.record_dropped(message.qos);
        }
        let qos1 = dropped
            .iter()
            .filter(|m| m.qos == QoS::AtLeastOnce)
            .count();
        tracing::warn!(
            count = dropped.len(),
            qos1,
            "Discarded undelivered messages from offline queue"
        );
    }

    /// Encodes and writes one PUBLISH. For `QoS` 1 a packet id is allocated
    /// and registered for its PUBACK before the write; `retransmit` reuses an
    /// existing id and sets DUP.
    async fn send_publish(
        &self,
        slot: &mut Option<ActiveWriter>,
        message: &OutboundMessage,
        retransmit: Option<u16>,
    ) -> Result<Sent, MqttError> {
        let version = self.inner.config.protocol_version;
        let active = slot.as_mut().ok_or(MqttError::NotConnected)?;

        let mut packet = PublishPacket::new(message.topic.clone(), message.payload.clone(), message.qos)
            .with_retain(message.retain);

        let registered = match (message.qos, retransmit) {
            (QoS::AtMostOnce, _) => None,
            (QoS::AtLeastOnce, Some(packet_id)) => {
                packet = packet.with_packet_id(packet_id).with_dup(true);
                None
            }
            (QoS::AtLeastOnce, None) => {
                let mut pending = self.inner.pending.lock().await;
                let packet_id = self
                    .inner
                    .packet_ids
                    .next_free(|id| pending.contains_key(&id))
                    .ok_or_else(|| {
                        MqttError::ProtocolError("no free packet identifiers".to_string())
                    })?;
                let (tx, rx) = oneshot::channel();
                pending.insert(packet_id, tx);
                packet = packet.with_packet_id(packet_id);
                Some((packet_id, rx))
            }
        };

        if let Err(e) = active.writer.write_packet(&Packet::Publish(packet), version).await {
            if let Some((packet_id, _)) = &registered {
                self.inner.pending.lock().await.remove(packet_id);
            }
            self.inner.signal_lost(active.generation, e.to_string());
            return Err(e);
        }

        // Retransmissions are counted separately by the caller
        if retransmit.is_none() {
            self.inner.stats.record_published(message.qos);
        }
        Ok(match registered {
            None => Sent::AtMostOnce,
            Some((packet_id, ack)) => Sent::AtLeastOnce { packet_id, ack },
        })
    }

    /// Waits for the PUBACK of `packet_id`, retransmitting with DUP on
    /// timeout. A lost connection puts the message back in the queue.
    async fn await_ack(
        &self,
        message: OutboundMessage,
        packet_id: u16,
        mut ack: oneshot::Receiver<u8>,
    ) -> Result<Ack, PublishError> {
        let config = &self.inner.config;
        let mut retries = 0u32;

        loop {
            match timeout(config.ack_timeout, &mut ack).await {
                Ok(Ok(reason_code)) if reason_code < 0x80 => {
                    self.inner.stats.record_acknowledged();
                    return Ok(Ack::Acknowledged { packet_id });
                }
                Ok(Ok(reason_code)) => {
                    return Err(PublishError::Rejected {
                        packet_id,
                        reason_code,
                    });
                }
                Ok(Err(_)) => {
                    if self.inner.closed.load(Ordering::Acquire) {
                        return Err(PublishError::Closed);
                    }
                    tracing::debug!(packet_id, topic = %message.topic, "Connection lost before PUBACK, requeueing");
                    return self.requeue(message).await;
                }
                Err(_) => {}
            }

            if retries >= config.max_publish_retries {
                self.inner.pending.lock().await.remove(&packet_id);
                self.inner.stats.record_ack_timeout();
                tracing::warn!(packet_id, topic = %message.topic, "Giving up waiting for PUBACK");
                return Err(PublishError::AckTimeout {
                    packet_id,
                    attempts: retries + 1,
                });
            }
            retries += 1;

            let mut slot = self.inner.writer.lock().await;
            tracing::debug!(packet_id, attempt = retries, "Retransmitting unacknowledged publish");
            match self.send_publish(&mut slot, &message, Some(packet_id)).await {
                Ok(_) => self.inner.stats.record_retransmission(),
                Err(_) => {
                    drop(slot);
                    self.inner.pending.lock().await.remove(&packet_id);
                    return self.requeue(message).await;
                }
            }
        }
    }

    /// Queues a message, applying the drop policy and counting losses
    fn enqueue(&self, queue: &mut OfflineQueue, message: OutboundMessage) -> Result<Ack, PublishError> {
        let qos = message.qos;
        let topic = message.topic.clone();
        match queue.push(message) {
            Ok(Enqueued::Stored) => {
                self.inner.stats.record_queued();
                Ok(Ack::Queued)
            }
            Ok(Enqueued::Evicted(oldest)) => {
                self.inner.stats.record_queued();
                self.inner.stats.record_dropped(oldest.qos);
                tracing::warn!(
                    topic = %oldest.topic,
                    qos = ?oldest.qos,
                    depth = queue.config().depth,
                    "Backpressure: offline queue full, dropped oldest message"
                );
                Ok(Ack::Queued)
            }
            Err(err) => {
                self.inner.stats.record_dropped(qos);
                tracing::warn!(%topic, ?qos, "Backpressure: offline queue full, dropped message");
                Err(err)
            }
        }
    }

    /// Puts an interrupted message back into the offline queue
    async fn requeue(&self, message: OutboundMessage) -> Result<Ack, PublishError> {
        let mut queue = self.inner.queue.lock().await;
        if self.state() == ConnectionState::Disconnected {
            self.inner.stats.record_dropped(message.qos);
            return Err(self.unavailable());
        }
        self.enqueue(&mut queue, message)
    }

    fn unavailable(&self) -> PublishError {
        if self.inner.closed.load(Ordering::Acquire) {
            PublishError::Closed
        } else {
            PublishError::NotConnected
        }
    }

    async fn publish_inner(&self, mut message: OutboundMessage) -> Result<Ack, PublishError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PublishError::Closed);
        }

        let ceiling = self.inner.config.qos_ceiling;
        if message.qos > ceiling {
            tracing::debug!(topic = %message.topic, requested = ?message.qos, ?ceiling, "Downgrading QoS to ceiling");
            message.qos = ceiling;
        }

        let mut queue = self.inner.queue.lock().await;
        let state = self.state();
        if state.is_pending() {
            return self.enqueue(&mut queue, message);
        }
        if state == ConnectionState::Disconnected {
            return Err(self.unavailable());
        }

        let mut slot = self.inner.writer.lock().await;
        drop(queue);

        match self.send_publish(&mut slot, &message, None).await {
            Ok(Sent::AtMostOnce) => Ok(Ack::Sent),
            Ok(Sent::AtLeastOnce { packet_id, ack }) => {
                drop(slot);
                self.await_ack(message, packet_id, ack).await
            }
            Err(e) => {
                drop(slot);
                tracing::debug!(topic = %message.topic, error = %e, "Publish write failed, requeueing");
                self.requeue(message).await
            }
        }
    }

    /// Publishes a payload; see [`Publisher::publish_message`]
    ///
    /// # Errors
    ///
    /// Returns a `PublishError` if the message is dropped, rejected or never
    /// acknowledged
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<bytes::Bytes>,
        qos: QoS,
    ) -> Result<Ack, PublishError> {
        self.publish_inner(OutboundMessage::new(topic, payload, qos))
            .await
    }

    /// Resolves once the session has permanently failed, with the reason
    ///
    /// Returns `ConnectionError::Closed` if the session is closed locally
    /// instead.
    pub async fn wait_until_failed(&self) -> ConnectionError {
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(err) = self.inner.fatal.lock().await.clone() {
                return err;
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return ConnectionError::Closed;
            }
            if state.changed().await.is_err() {
                return ConnectionError::Closed;
            }
        }
    }

    /// Sends DISCONNECT and stops all background tasks
    ///
    /// Messages still in the offline queue are discarded and counted as
    /// dropped. Calling `close` more than once is harmless.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            handle.abort();
        }

        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            self.apply(ConnectionEvent::Closed);
            queue.drain()
        };

        let version = self.inner.config.protocol_version;
        let taken = self.inner.writer.lock().await.take();
        if let Some(mut active) = taken {
            let disconnect = Packet::Disconnect(DisconnectPacket::normal());
            let goodbye = async {
                active.writer.write_packet(&disconnect, version).await?;
                active.writer.shutdown().await?;
                Ok::<(), MqttError>(())
            };
            if let Ok(Err(e)) = timeout(SHUTDOWN_GRACE, goodbye).await {
                tracing::debug!(error = %e, "DISCONNECT not delivered");
            }
        }

        for task in self.inner.conn_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.pending.lock().await.clear();
        self.record_discarded(&dropped);
        tracing::info!(broker = %self.inner.config.broker_address(), "Disconnected from broker");
    }
}

impl Publisher for ConnectionManager {
    fn publish_message(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<Ack, PublishError>> + Send + '_ {
        self.publish_inner(message)
    }

    fn close(&self) -> impl Future<Output = ()> + Send + '_ {
        ConnectionManager::close(self)
    }

    fn stats(&self) -> Option<StatsSnapshot> {
        Some(self.inner.stats.snapshot())
    }
}

/// Dispatches acknowledgments until the connection ends
async fn read_loop(inner: Arc<Inner>, mut reader: TransportReader, generation: u64) {
    let version = inner.config.protocol_version;
    let reason = loop {
        match reader.read_packet(version).await {
            Ok(Packet::PubAck(ack)) => {
                match inner.pending.lock().await.remove(&ack.packet_id) {
                    Some(waiter) => {
                        let _ = waiter.send(ack.reason_code);
                    }
                    None => {
                        tracing::debug!(packet_id = ack.packet_id, "PUBACK for unknown packet id");
                    }
                }
            }
            Ok(Packet::PingResp) => inner.ping_outstanding.store(false, Ordering::Release),
            Ok(Packet::Disconnect(disconnect)) => {
                break format!(
                    "broker sent DISCONNECT (reason code {:#04x})",
                    disconnect.reason_code
                );
            }
            Ok(other) => {
                tracing::debug!(packet_type = ?other.packet_type(), "Ignoring unexpected packet");
            }
            Err(e) => break e.to_string(),
        }
    };
    inner.signal_lost(generation, reason);
}

/// Sends PINGREQ every keep alive period. A ping still unanswered one period
/// later means the broker is gone.
async fn keepalive_loop(inner: Arc<Inner>, generation: u64) {
    let period = Duration::from_secs(u64::from(keep_alive_secs(inner.config.keep_alive)));
    if period.is_zero() {
        return;
    }
    let version = inner.config.protocol_version;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if inner.current_generation() != generation {
            return;
        }
        if inner.ping_outstanding.swap(true, Ordering::AcqRel) {
            inner.signal_lost(generation, "keep alive timeout");
            return;
        }

        let mut slot = inner.writer.lock().await;
        let Some(active) = slot.as_mut().filter(|w| w.generation == generation) else {
            return;
        };
        if let Err(e) = active.writer.write_packet(&Packet::PingReq, version).await {
            drop(slot);
            inner.signal_lost(generation, format!("PINGREQ failed: {e}"));
            return;
        }
    }
}
