//! Common test utilities: an in-process broker that speaks just enough MQTT
//! for a publish-only client

#![allow(dead_code)]

use mqtt_device_sim::packet::{ConnAckPacket, Packet, PubAckPacket, PublishPacket};
use mqtt_device_sim::transport::{PacketReader, PacketWriter};
use mqtt_device_sim::{ConnectionConfig, ProtocolVersion, QoS, ReconnectConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use ulid::Ulid;

/// Default timeout for test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Generate a unique test client ID
pub fn test_client_id(test_name: &str) -> String {
    format!("test-{}-{}", test_name, Ulid::new())
}

/// Routes library logs to the test output; set `RUST_LOG` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqtt_device_sim=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Connection settings tuned for fast tests against a [`FakeBroker`]
pub fn fast_config(port: u16, test_name: &str) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", port)
        .with_client_id(test_client_id(test_name))
        .with_connect_timeout(Duration::from_secs(1))
        .with_ack_timeout(Duration::from_millis(300), 3)
        .with_startup_attempts(3)
        .with_reconnect(
            ReconnectConfig::default()
                .with_delays(Duration::from_millis(20), Duration::from_millis(200))
                .with_jitter(0.0),
        )
}

#[derive(Debug, Clone)]
struct Behavior {
    /// Accept TCP connections but close them before CONNACK
    accepting: bool,
    /// CONNACK return code; non-zero refuses the session
    connack_code: u8,
    /// Answer QoS 1 publishes with PUBACK
    ack_publishes: bool,
    /// PUBACK reason code
    puback_code: u8,
    /// Answer PINGREQ with PINGRESP
    answer_pings: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            accepting: true,
            connack_code: 0,
            ack_publishes: true,
            puback_code: 0,
            answer_pings: true,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    client_ids: Vec<String>,
    versions: Vec<ProtocolVersion>,
    keep_alives: Vec<u16>,
    publishes: Vec<PublishPacket>,
    disconnects: usize,
    pings: usize,
    handshake_failures: usize,
}

#[derive(Default)]
struct Shared {
    behavior: Mutex<Behavior>,
    recorded: Mutex<Recorded>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process broker bound to an ephemeral localhost port
pub struct FakeBroker {
    port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::listen(None).await
    }

    /// Broker that runs every session over TLS with the given server config
    pub async fn start_with_tls(tls: Arc<rustls::ServerConfig>) -> Self {
        Self::listen(Some(TlsAcceptor::from(tls))).await
    }

    async fn listen(acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                let session = match acceptor.clone() {
                    None => tokio::spawn(serve(stream, shared)),
                    Some(acceptor) => tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => serve(tls_stream, shared).await,
                            Err(_) => shared.recorded.lock().await.handshake_failures += 1,
                        }
                    }),
                };
                accept_shared.sessions.lock().await.push(session);
            }
        });

        Self {
            port,
            shared,
            accept_task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self, test_name: &str) -> ConnectionConfig {
        fast_config(self.port, test_name)
    }

    /// Kills every open session without a DISCONNECT
    pub async fn drop_connections(&self) {
        for session in self.shared.sessions.lock().await.drain(..) {
            session.abort();
        }
    }

    /// While false, new connections are closed before CONNACK
    pub async fn set_accepting(&self, accepting: bool) {
        self.shared.behavior.lock().await.accepting = accepting;
    }

    pub async fn set_connack_code(&self, code: u8) {
        self.shared.behavior.lock().await.connack_code = code;
    }

    pub async fn set_ack_publishes(&self, ack: bool) {
        self.shared.behavior.lock().await.ack_publishes = ack;
    }

    pub async fn set_puback_code(&self, code: u8) {
        self.shared.behavior.lock().await.puback_code = code;
    }

    /// While false, PINGREQ is recorded but never answered
    pub async fn set_answer_pings(&self, answer: bool) {
        self.shared.behavior.lock().await.answer_pings = answer;
    }

    pub async fn publishes(&self) -> Vec<PublishPacket> {
        self.shared.recorded.lock().await.publishes.clone()
    }

    pub async fn connections(&self) -> usize {
        self.shared.recorded.lock().await.client_ids.len()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.shared.recorded.lock().await.client_ids.clone()
    }

    pub async fn versions(&self) -> Vec<ProtocolVersion> {
        self.shared.recorded.lock().await.versions.clone()
    }

    /// Keep alive seconds declared by each CONNECT
    pub async fn keep_alives(&self) -> Vec<u16> {
        self.shared.recorded.lock().await.keep_alives.clone()
    }

    pub async fn disconnects(&self) -> usize {
        self.shared.recorded.lock().await.disconnects
    }

    pub async fn pings(&self) -> usize {
        self.shared.recorded.lock().await.pings
    }

    pub async fn handshake_failures(&self) -> usize {
        self.shared.recorded.lock().await.handshake_failures
    }

    /// Polls until at least `count` PINGREQs arrived
    pub async fn wait_for_pings(&self, count: usize) {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            while self.pings().await < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fewer than {count} pings arrived"));
    }

    /// Polls until at least `count` publishes arrived
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<PublishPacket> {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            loop {
                let publishes = self.publishes().await;
                if publishes.len() >= count {
                    return publishes;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fewer than {count} publishes arrived"))
    }

    /// Polls until at least `count` sessions completed CONNECT
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            while self.connections().await < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fewer than {count} connections arrived"));
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(mut sessions) = self.shared.sessions.try_lock() {
            for session in sessions.drain(..) {
                session.abort();
            }
        }
    }
}

async fn serve<S>(stream: S, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let behavior = shared.behavior.lock().await.clone();
    if !behavior.accepting {
        return;
    }
    let (mut reader, mut writer) = tokio::io::split(stream);

    let Ok(Packet::Connect(connect)) = reader.read_packet(ProtocolVersion::V5).await else {
        return;
    };
    let version = connect.protocol_version;
    {
        let mut recorded = shared.recorded.lock().await;
        recorded.client_ids.push(connect.client_id.clone());
        recorded.versions.push(version);
        recorded.keep_alives.push(connect.keep_alive);
    }

    let connack = Packet::ConnAck(ConnAckPacket::new(false, behavior.connack_code));
    if writer.write_packet(&connack, version).await.is_err() || behavior.connack_code != 0 {
        return;
    }

    while let Ok(packet) = reader.read_packet(version).await {
        match packet {
            Packet::Publish(publish) => {
                let packet_id = publish.packet_id;
                let qos = publish.qos;
                shared.recorded.lock().await.publishes.push(publish);

                let behavior = shared.behavior.lock().await.clone();
                if let (QoS::AtLeastOnce, Some(id), true) = (qos, packet_id, behavior.ack_publishes)
                {
                    let mut ack = PubAckPacket::new(id);
                    ack.reason_code = behavior.puback_code;
                    if writer.write_packet(&Packet::PubAck(ack), version).await.is_err() {
                        return;
                    }
                }
            }
            Packet::PingReq => {
                shared.recorded.lock().await.pings += 1;
                let answer = shared.behavior.lock().await.answer_pings;
                if answer && writer.write_packet(&Packet::PingResp, version).await.is_err() {
                    return;
                }
            }
            Packet::Disconnect(_) => {
                shared.recorded.lock().await.disconnects += 1;
                return;
            }
            _ => return,
        }
    }
}
