//! Client side of the control channel: one TLS 1.3 session per configured
//! connection, carrying length-prefixed control packets both ways.
//!
//! The session splits into a writer task (owning the sink), a reader task
//! (dispatching publishes, acks and keepalives) and a 3s ping loop. Once
//! the link drops every pending and subsequent publish fails immediately;
//! the transport reacts by tearing down its local sockets instead of
//! buffering.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use protocol::{
    config::ConnectionConfig,
    control::{ControlCodec, ControlPacket},
    sink::ControlPublisher,
    topic::ControlTopic,
};
use rustls::{
    pki_types::{CertificateDer, ServerName},
    RootCertStore,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use url::Url;

mod verifier;

use verifier::TunnelServerVerifier;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_SERVER_PORT: u16 = 2333;

/// Missing this many keepalive windows marks the peer dead.
const KEEPALIVE_MISSES: u32 = 3;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

enum WriterCmd {
    Send(ControlPacket, Option<oneshot::Sender<anyhow::Result<()>>>),
}

pub enum ChannelEvent {
    Message { topic: ControlTopic, payload: Vec<u8> },
    Disconnected,
}

type AckMap = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

pub struct ControlChannel {
    requester: ChannelRequester,
    event_rx: mpsc::Receiver<ChannelEvent>,
}

impl ControlChannel {
    pub async fn connect(connection: &ConnectionConfig, ca_certs: &[CertificateDer<'static>]) -> anyhow::Result<Self> {
        let url = Url::parse(&connection.server_url)?;
        let host = url.host_str().ok_or_else(|| anyhow!("server url {} has no host", connection.server_url))?.to_string();
        let port = url.port().unwrap_or(DEFAULT_SERVER_PORT);

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert.clone())?;
        }
        let verifier = TunnelServerVerifier::new(roots, !connection.reject_unauthorized)?;
        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        log::info!("[ControlChannel] connecting to {host}:{port}");
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let tls_stream = connector.connect(ServerName::try_from(host.clone())?, stream).await?;
        let mut framed = Framed::new(tls_stream, ControlCodec);

        framed
            .send(ControlPacket::Hello {
                client_id: connection.client_id().to_string(),
            })
            .await?;
        match tokio::time::timeout(ACK_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(ControlPacket::HelloAck { success: true, .. }))) => {}
            Ok(Some(Ok(ControlPacket::HelloAck { success: false, message }))) => {
                anyhow::bail!("session refused: {}", message.unwrap_or_default())
            }
            Ok(Some(Ok(other))) => anyhow::bail!("unexpected handshake packet {other:?}"),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => anyhow::bail!("connection closed during handshake"),
            Err(_) => anyhow::bail!("handshake timed out"),
        }
        log::info!("[ControlChannel] session established to {host}:{port}");

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WriterCmd>(64);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(64);
        let connected = Arc::new(AtomicBool::new(true));
        let acks: AckMap = Default::default();

        let (mut sink, mut stream) = framed.split();

        let writer_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(WriterCmd::Send(packet, done)) = cmd_rx.recv().await {
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
        });

        let keepalive_cmd = cmd_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if keepalive_cmd.send(WriterCmd::Send(ControlPacket::Ping, None)).await.is_err() {
                    break;
                }
            }
        });

        let read_connected = connected.clone();
        let read_acks = acks.clone();
        let read_cmd = cmd_tx.clone();
        tokio::spawn(async move {
            let idle_window = KEEPALIVE_INTERVAL * KEEPALIVE_MISSES;
            loop {
                let packet = match tokio::time::timeout(idle_window, stream.next()).await {
                    Err(_) => {
                        log::warn!("[ControlChannel] no traffic for {}s => disconnect", idle_window.as_secs());
                        break;
                    }
                    Ok(None) => {
                        log::info!("[ControlChannel] closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        log::warn!("[ControlChannel] read error: {e}");
                        break;
                    }
                    Ok(Some(Ok(packet))) => packet,
                };

                match packet {
                    ControlPacket::Publish { seq, topic, qos, payload } => {
                        if qos > 0 {
                            read_cmd.send(WriterCmd::Send(ControlPacket::PubAck { seq }, None)).await.ok();
                        }
                        match topic.parse::<ControlTopic>() {
                            Ok(topic) => {
                                if event_tx.send(ChannelEvent::Message { topic, payload }).await.is_err() {
                                    break;
                                }
                            }
                            // Unattributable message; nothing to route it to.
                            Err(e) => log::debug!("[ControlChannel] dropping publish: {e}"),
                        }
                    }
                    ControlPacket::PubAck { seq } => {
                        if let Some(tx) = read_acks.lock().remove(&seq) {
                            tx.send(()).ok();
                        }
                    }
                    ControlPacket::Ping => {
                        read_cmd.send(WriterCmd::Send(ControlPacket::Pong, None)).await.ok();
                    }
                    ControlPacket::Pong => {}
                    other => log::debug!("[ControlChannel] unexpected packet {other:?}"),
                }
            }

            read_connected.store(false, Ordering::SeqCst);
            // Publishes waiting for an ack fail right away.
            read_acks.lock().clear();
            event_tx.send(ChannelEvent::Disconnected).await.ok();
        });

        Ok(Self {
            requester: ChannelRequester {
                cmd_tx,
                connected,
                acks,
                seq: Arc::new(AtomicU64::new(0)),
                qos: connection.qos,
            },
            event_rx,
        })
    }

    pub fn requester(&self) -> ChannelRequester {
        self.requester.clone()
    }

    pub async fn recv(&mut self) -> anyhow::Result<ChannelEvent> {
        self.event_rx.recv().await.ok_or_else(|| anyhow!("control channel closed"))
    }
}

#[derive(Clone)]
pub struct ChannelRequester {
    cmd_tx: mpsc::Sender<WriterCmd>,
    connected: Arc<AtomicBool>,
    acks: AckMap,
    seq: Arc<AtomicU64>,
    qos: u8,
}

#[async_trait::async_trait]
impl ControlPublisher for ChannelRequester {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: ControlTopic, payload: Vec<u8>) -> anyhow::Result<()> {
        if !self.is_connected() {
            anyhow::bail!("control channel offline");
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
            anyhow::bail!("control channel offline");
        }
        match sent_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.acks.lock().remove(&seq);
                return Err(e);
            }
            Err(_) => {
                self.acks.lock().remove(&seq);
                anyhow::bail!("control channel offline");
            }
        }

        if let Some(ack_rx) = ack_rx {
            match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => anyhow::bail!("control channel offline"),
                Err(_) => {
                    self.acks.lock().remove(&seq);
                    anyhow::bail!("publish for {topic} not acknowledged");
                }
            }
        }
        Ok(())
    }
}
