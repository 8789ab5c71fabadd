//! Client transport: binds one configured connection to its socket
//! adapters and relays adapter events over the control channel, while
//! demultiplexing inbound channel messages back to the right adapter by
//! belong id.

use std::sync::Arc;

use protocol::{
    config::ConnectionConfig,
    crypto::{CryptoError, TunnelCipher},
    frame,
    queue::QueueMap,
    sink::{ControlPublisher, SocketEventSink},
    socket::AdapterRegistry,
    topic::ControlTopic,
    BelongId, ConnectionKey, ConnectionType, TransportType,
};

use crate::local_tunnel;

pub struct ClientTransport {
    connection: ConnectionConfig,
    cipher: Option<Arc<TunnelCipher>>,
    registry: AdapterRegistry,
    queues: QueueMap,
}

impl ClientTransport {
    pub fn new(connection: ConnectionConfig, publisher: Arc<dyn ControlPublisher>) -> anyhow::Result<Self> {
        let cipher = connection.encryption.as_ref().map(TunnelCipher::new).transpose()?.map(Arc::new);
        let sink = Arc::new(ChannelEventSink {
            key: connection.key(),
            cipher: cipher.clone(),
            publisher,
        });
        let queues = QueueMap::default();
        Ok(Self {
            registry: AdapterRegistry::new(sink, queues.clone()),
            queues,
            cipher,
            connection,
        })
    }

    /// Dispatches one inbound control-channel message. Called sequentially
    /// from the session loop, which keeps per-belong-id submission order
    /// equal to publish order.
    pub async fn handle_message(&self, topic: ControlTopic, payload: Vec<u8>) {
        if topic.key != self.connection.key() {
            log::debug!("[ClientTransport] dropping message for foreign key {}", topic.key);
            return;
        }
        let belong_id = topic.belong_id;

        match topic.transport_type {
            TransportType::Connection => {
                // UDP has no connection phase; flows self-create on first message.
                if self.connection.connection_type == ConnectionType::Udp {
                    return;
                }
                let queue = self.queues.get_or_create(&belong_id);
                let registry = self.registry.clone();
                let host = self.connection.local_host.clone();
                let port = self.connection.local_port;
                let task_id = belong_id.clone();
                let res = queue.run(async move { local_tunnel::tcp::connect(&registry, &task_id, &host, port).await }).await;
                if let Err(e) = res {
                    log::warn!("[ClientTransport] create {belong_id} error: {e}");
                    if !self.registry.contains(&belong_id) {
                        // Tell the edge right away so it drops its socket.
                        if let Err(e) = self.registry.sink().on_destroyed(&belong_id).await {
                            log::warn!("[ClientTransport] destroyed event {belong_id} error: {e}");
                        }
                        self.queues.remove(&belong_id);
                    }
                }
            }
            TransportType::Message => {
                let chunk = match self.decrypt(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("[ClientTransport] decrypt for {belong_id} error: {e}");
                        return;
                    }
                };
                if self.connection.connection_type == ConnectionType::Udp && !self.registry.contains(&belong_id) {
                    if let Err(e) = local_tunnel::udp::open_flow(&self.registry, &belong_id, &self.connection.local_host, self.connection.local_port).await {
                        log::warn!("[ClientTransport] open udp flow {belong_id} error: {e}");
                        return;
                    }
                }
                if let Err(e) = self.registry.write(&belong_id, chunk).await {
                    log::warn!("[ClientTransport] write {belong_id} error: {e} => destroying");
                    self.registry.destroy(&belong_id).await;
                }
            }
            TransportType::Destroyed => {
                // Flush every pending write before the destroy is queued.
                if let Some(queue) = self.queues.get(&belong_id) {
                    queue.wait_idle().await;
                }
                self.registry.destroy(&belong_id).await;
                self.queues.remove(&belong_id);
            }
        }
    }

    /// Tears down every live adapter; used when the control session ends.
    pub async fn shutdown(&self) {
        self.registry.destroy_all().await;
    }

    fn decrypt(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let parsed = frame::decode(payload)?;
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        Ok(cipher.decrypt(&parsed)?)
    }
}

struct ChannelEventSink {
    key: ConnectionKey,
    cipher: Option<Arc<TunnelCipher>>,
    publisher: Arc<dyn ControlPublisher>,
}

#[async_trait::async_trait]
impl SocketEventSink for ChannelEventSink {
    async fn on_connection(&self, _belong_id: &BelongId) -> anyhow::Result<()> {
        // The edge originates connections; the client never announces them.
        Ok(())
    }

    async fn on_data(&self, belong_id: &BelongId, chunk: &[u8]) -> anyhow::Result<()> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        let payload = frame::encode(&cipher.encrypt(chunk)?)?;
        self.publisher
            .publish(ControlTopic::new(self.key, TransportType::Message, belong_id.clone()), payload)
            .await
    }

    async fn on_destroyed(&self, belong_id: &BelongId) -> anyhow::Result<()> {
        self.publisher
            .publish(ControlTopic::new(self.key, TransportType::Destroyed, belong_id.clone()), Vec::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use parking_lot::Mutex;
    use protocol::config::EncryptionConfig;
    use test_log::test;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, UdpSocket},
    };

    use super::*;

    struct StubPublisher {
        offline: AtomicBool,
        published: Mutex<Vec<(ControlTopic, Vec<u8>)>>,
    }

    impl StubPublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                offline: AtomicBool::new(false),
                published: Mutex::new(Vec::new()),
            })
        }

        fn topics(&self) -> Vec<ControlTopic> {
            self.published.lock().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl ControlPublisher for StubPublisher {
        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }

        async fn publish(&self, topic: ControlTopic, payload: Vec<u8>) -> anyhow::Result<()> {
            self.published.lock().push((topic, payload));
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("control channel offline");
            }
            Ok(())
        }
    }

    fn encryption() -> EncryptionConfig {
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::STANDARD;
        EncryptionConfig {
            aes_key: engine.encode([7u8; 32]),
            iv: engine.encode([9u8; 12]),
        }
    }

    fn connection(connection_type: ConnectionType, local_port: u16) -> ConnectionConfig {
        ConnectionConfig {
            connection_type,
            server_url: "tls://tunnel.test:2333".to_string(),
            uuid: "u-1".to_string(),
            secret_key: "s-1".to_string(),
            local_host: "127.0.0.1".to_string(),
            local_port,
            bind_port: 9000,
            bind_domains: vec![],
            encryption: Some(encryption()),
            has_ssl: false,
            reject_unauthorized: true,
            qos: 0,
        }
    }

    fn message(cipher: &TunnelCipher, belong_id: &BelongId, chunk: &[u8]) -> (ControlTopic, Vec<u8>) {
        let key = ConnectionKey {
            bind_port: 9000,
            connection_type: ConnectionType::Tcp,
        };
        let payload = frame::encode(&cipher.encrypt(chunk).expect("should encrypt")).expect("should frame");
        (ControlTopic::new(key, TransportType::Message, belong_id.clone()), payload)
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test(tokio::test)]
    async fn writes_are_ordered_and_stop_after_destroy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let local_port = listener.local_addr().expect("should have addr").port();
        let service = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("should accept");
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.expect("should read");
            received
        });

        let config = connection(ConnectionType::Tcp, local_port);
        let cipher = TunnelCipher::new(&encryption()).expect("should build cipher");
        let transport = ClientTransport::new(config.clone(), StubPublisher::new()).expect("should build transport");
        let belong_id = BelongId::generate();

        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Connection, belong_id.clone()),
                Vec::new(),
            )
            .await;

        let mut expected = Vec::new();
        for i in 0..20u8 {
            let chunk = vec![i; 32];
            expected.extend_from_slice(&chunk);
            let (topic, payload) = message(&cipher, &belong_id, &chunk);
            transport.handle_message(topic, payload).await;
        }
        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Destroyed, belong_id.clone()),
                Vec::new(),
            )
            .await;
        // Anything after the destroy must never reach the service.
        let (topic, payload) = message(&cipher, &belong_id, b"late");
        transport.handle_message(topic, payload).await;

        let received = service.await.expect("service should finish");
        assert_eq!(received, expected);
    }

    #[test(tokio::test)]
    async fn undecryptable_messages_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let local_port = listener.local_addr().expect("should have addr").port();
        let service = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("should accept");
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.expect("should read");
            received
        });

        let config = connection(ConnectionType::Tcp, local_port);
        let cipher = TunnelCipher::new(&encryption()).expect("should build cipher");
        let transport = ClientTransport::new(config.clone(), StubPublisher::new()).expect("should build transport");
        let belong_id = BelongId::generate();

        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Connection, belong_id.clone()),
                Vec::new(),
            )
            .await;
        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Message, belong_id.clone()),
                b"not a frame".to_vec(),
            )
            .await;
        let (topic, payload) = message(&cipher, &belong_id, b"valid");
        transport.handle_message(topic, payload).await;
        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Destroyed, belong_id.clone()),
                Vec::new(),
            )
            .await;

        assert_eq!(service.await.expect("service should finish"), b"valid");
    }

    #[test(tokio::test)]
    async fn offline_channel_tears_down_instead_of_buffering() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let local_port = listener.local_addr().expect("should have addr").port();
        let service = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("should accept");
            socket.write_all(b"local data").await.expect("should write");
            let mut sink = Vec::new();
            socket.read_to_end(&mut sink).await.ok();
        });

        let config = connection(ConnectionType::Tcp, local_port);
        let publisher = StubPublisher::new();
        let transport = ClientTransport::new(config.clone(), publisher.clone()).expect("should build transport");
        let belong_id = BelongId::generate();

        publisher.offline.store(true, Ordering::SeqCst);
        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Connection, belong_id.clone()),
                Vec::new(),
            )
            .await;

        // The failed forward must escalate to a local teardown attempt,
        // visible as a destroyed publish.
        wait_until(|| {
            publisher
                .topics()
                .iter()
                .any(|t| t.transport_type == TransportType::Destroyed && t.belong_id == belong_id)
        })
        .await;
        service.await.expect("service should finish");
    }

    #[test(tokio::test)]
    async fn udp_flow_created_on_demand_and_replies_forwarded() {
        let service_socket = UdpSocket::bind("127.0.0.1:0").await.expect("should bind");
        let local_port = service_socket.local_addr().expect("should have addr").port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, peer) = service_socket.recv_from(&mut buf).await.expect("should receive");
            assert_eq!(&buf[..len], b"ping");
            service_socket.send_to(b"pong", peer).await.expect("should reply");
        });

        let config = connection(ConnectionType::Udp, local_port);
        let cipher = TunnelCipher::new(&encryption()).expect("should build cipher");
        let publisher = StubPublisher::new();
        let transport = ClientTransport::new(config.clone(), publisher.clone()).expect("should build transport");
        let belong_id = BelongId::generate();

        let payload = frame::encode(&cipher.encrypt(b"ping").expect("should encrypt")).expect("should frame");
        transport
            .handle_message(
                ControlTopic::new(config.key(), TransportType::Message, belong_id.clone()),
                payload,
            )
            .await;

        wait_until(|| {
            publisher
                .topics()
                .iter()
                .any(|t| t.transport_type == TransportType::Message && t.belong_id == belong_id)
        })
        .await;

        let published = publisher.published.lock().clone();
        let (_, reply) = published
            .iter()
            .find(|(t, _)| t.transport_type == TransportType::Message)
            .expect("should have reply");
        let decoded = frame::decode(reply).expect("should decode");
        assert_eq!(cipher.decrypt(&decoded).expect("should decrypt"), b"pong");
    }
}
