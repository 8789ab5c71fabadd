//! Broker endpoint of the control channel: accepts TLS 1.3 sessions from
//! agents, validates their identity against the configured connections and
//! shuttles control packets between the socket transports and the wire.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use protocol::{
    config::ConnectionConfig,
    control::{ControlCodec, ControlPacket},
    sink::ControlPublisher,
    topic::{ClientId, ControlTopic},
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{
        mpsc::{channel, Receiver, Sender},
        oneshot,
    },
};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use crate::metrics::{METRICS_SESSION_COUNT, METRICS_SESSION_ERROR_COUNT, METRICS_SESSION_LIVE};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Three missed 3s keepalives and the session is considered dead.
const SESSION_IDLE_WINDOW: Duration = Duration::from_secs(9);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

enum WriterCmd {
    Send(ControlPacket, Option<oneshot::Sender<anyhow::Result<()>>>),
    Close,
}

type AckMap = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

pub enum ControlListenerEvent {
    SessionConnected(ClientId),
    Message { topic: ControlTopic, payload: Vec<u8> },
    SessionDisconnected(ClientId),
}

pub struct ControlListener {
    tls_acceptor: TlsAcceptor,
    listener: TcpListener,
    allowed: Arc<HashSet<String>>,
    qos: u8,
    sessions: crate::session::SessionStore,
    internal_tx: Sender<ControlListenerEvent>,
    internal_rx: Receiver<ControlListenerEvent>,
}

impl ControlListener {
    pub async fn new(
        addr: SocketAddr,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        connections: &[ConnectionConfig],
        qos: u8,
        sessions: crate::session::SessionStore,
    ) -> anyhow::Result<Self> {
        log::info!("[ControlListener] starting on {addr}");
        let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        let (internal_tx, internal_rx) = channel(1024);

        Ok(Self {
            tls_acceptor: TlsAcceptor::from(Arc::new(config)),
            listener: TcpListener::bind(addr).await?,
            allowed: Arc::new(connections.iter().map(|c| c.client_id().to_string()).collect()),
            qos,
            sessions,
            internal_tx,
            internal_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn recv(&mut self) -> anyhow::Result<ControlListenerEvent> {
        loop {
            let (stream, remote) = select! {
                incoming = self.listener.accept() => incoming?,
                event = self.internal_rx.recv() => break Ok(event.expect("should receive event from internal channel")),
            };

            let tls_acceptor = self.tls_acceptor.clone();
            let allowed = self.allowed.clone();
            let qos = self.qos;
            let sessions = self.sessions.clone();
            let internal_tx = self.internal_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = run_session(tls_acceptor, stream, remote, allowed, qos, sessions, internal_tx).await {
                    counter!(METRICS_SESSION_ERROR_COUNT).increment(1);
                    log::warn!("[ControlListener] session {remote} error: {e}");
                }
            });
        }
    }
}

async fn run_session(
    tls_acceptor: TlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    allowed: Arc<HashSet<String>>,
    qos: u8,
    sessions: crate::session::SessionStore,
    internal_tx: Sender<ControlListenerEvent>,
) -> anyhow::Result<()> {
    log::info!("[ControlListener] new connection from {remote}, handshaking tls");
    let tls_stream = tls_acceptor.accept(stream).await?;
    let mut framed = Framed::new(tls_stream, ControlCodec);

    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(ControlPacket::Hello { client_id }))) => client_id,
        Ok(Some(Ok(other))) => return Err(anyhow!("expected hello, got {other:?}")),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Err(anyhow!("closed before hello")),
        Err(_) => return Err(anyhow!("hello timed out")),
    };

    let client_id: ClientId = match hello.parse() {
        Ok(client_id) if allowed.contains(&hello) => client_id,
        _ => {
            framed
                .send(ControlPacket::HelloAck {
                    success: false,
                    message: Some("unknown client".to_string()),
                })
                .await
                .ok();
            return Err(anyhow!("refused session {hello} from {remote}"));
        }
    };
    framed.send(ControlPacket::HelloAck { success: true, message: None }).await?;

    let session_id: u64 = rand::random();
    log::info!("[ControlListener] session {client_id} {session_id:02x} from {remote} validated");
    counter!(METRICS_SESSION_COUNT).increment(1);
    gauge!(METRICS_SESSION_LIVE).increment(1.0);

    let (cmd_tx, mut cmd_rx) = channel::<WriterCmd>(64);
    let connected = Arc::new(AtomicBool::new(true));
    let acks: AckMap = Default::default();
    let publisher = SessionPublisher {
        cmd_tx,
        connected: connected.clone(),
        acks: acks.clone(),
        seq: Arc::new(AtomicU64::new(0)),
        qos,
    };
    sessions.add(client_id.key, session_id, publisher.clone());
    internal_tx.send(ControlListenerEvent::SessionConnected(client_id.clone())).await.ok();

    let (mut sink, mut stream_rx) = framed.split();
    let writer_connected = connected.clone();
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                WriterCmd::Send(packet, done) => {
                    let res = sink.send(packet).await;
                    let failed = res.is_err();
                    if let Some(done) = done {
                        done.send(res.map_err(Into::into)).ok();
                    }
                    if failed {
                        writer_connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                WriterCmd::Close => break,
            }
        }
    });

    loop {
        // Flips when a reconnecting client supersedes this session.
        if !connected.load(Ordering::SeqCst) {
            log::info!("[ControlListener] session {client_id} {session_id:02x} superseded");
            break;
        }
        let packet = match tokio::time::timeout(SESSION_IDLE_WINDOW, stream_rx.next()).await {
            Err(_) => {
                log::warn!("[ControlListener] session {client_id} {session_id:02x} idle => dropping");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                log::warn!("[ControlListener] session {client_id} {session_id:02x} read error: {e}");
                break;
            }
            Ok(Some(Ok(packet))) => packet,
        };

        match packet {
            ControlPacket::Publish { seq, topic, qos, payload } => {
                if qos > 0 {
                    publisher.send_raw(ControlPacket::PubAck { seq }).await;
                }
                match topic.parse::<ControlTopic>() {
                    Ok(topic) if topic.key == client_id.key => {
                        if internal_tx.send(ControlListenerEvent::Message { topic, payload }).await.is_err() {
                            break;
                        }
                    }
                    // Foreign or unparseable address: nothing to route to.
                    Ok(topic) => log::debug!("[ControlListener] dropping publish for foreign key {}", topic.key),
                    Err(e) => log::debug!("[ControlListener] dropping publish: {e}"),
                }
            }
            ControlPacket::PubAck { seq } => {
                if let Some(tx) = acks.lock().remove(&seq) {
                    tx.send(()).ok();
                }
            }
            ControlPacket::Ping => publisher.send_raw(ControlPacket::Pong).await,
            ControlPacket::Pong => {}
            other => log::debug!("[ControlListener] unexpected packet {other:?}"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    acks.lock().clear();
    sessions.remove(&client_id.key, session_id);
    gauge!(METRICS_SESSION_LIVE).decrement(1.0);
    internal_tx.send(ControlListenerEvent::SessionDisconnected(client_id.clone())).await.ok();
    log::info!("[ControlListener] session {client_id} {session_id:02x} closed");
    Ok(())
}

/// Publish handle onto one live session; held by the session store and the
/// bind adapters' event sinks.
#[derive(Clone)]
pub struct SessionPublisher {
    cmd_tx: Sender<WriterCmd>,
    connected: Arc<AtomicBool>,
    acks: AckMap,
    seq: Arc<AtomicU64>,
    qos: u8,
}

impl SessionPublisher {
    /// Marks the session dead and stops its writer; used on supersession.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cmd_tx.try_send(WriterCmd::Close).ok();
    }

    async fn send_raw(&self, packet: ControlPacket) {
        self.cmd_tx.send(WriterCmd::Send(packet, None)).await.ok();
    }
}

#[async_trait::async_trait]
impl ControlPublisher for SessionPublisher {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: ControlTopic, payload: Vec<u8>) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("client session offline");
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let ack_rx = if self.qos > 0 {
            let (tx, rx) = oneshot::channel();
            self.acks.lock().insert(seq, tx);
            Some(rx)
        } else {
            None
        };

        let (sent_tx, sent_rx) = oneshot::channel();
        let packet = ControlPacket::Publish {
            seq,
            topic: topic.to_string(),
            qos: self.qos,
            payload,
        };
        if self.cmd_tx.send(WriterCmd::Send(packet, Some(sent_tx))).await.is_err() {
            self.acks.lock().remove(&seq);
            anyhow::bail!("client session offline");
        }
        match sent_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.acks.lock().remove(&seq);
                return Err(e);
            }
            Err(_) => {
                self.acks.lock().remove(&seq);
                anyhow::bail!("client session offline");
            }
        }

        if let Some(ack_rx) = ack_rx {
            match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => anyhow::bail!("client session offline"),
                Err(_) => {
                    self.acks.lock().remove(&seq);
                    anyhow::bail!("publish for {topic} not acknowledged");
                }
            }
        }
        Ok(())
    }
}
