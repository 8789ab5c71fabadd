//! Server transport: one bind listener per configured connection, adapter
//! events published to the matching client session, inbound channel
//! messages demultiplexed back onto the edge sockets by belong id.

use std::{collections::HashMap, sync::Arc};

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
use tokio::task::JoinHandle;

use crate::{bind_listener, session::SessionStore};

pub struct ServerTransport {
    workers: HashMap<ConnectionKey, ConnectionWorker>,
    listeners: Vec<JoinHandle<()>>,
}

struct ConnectionWorker {
    cipher: Option<Arc<TunnelCipher>>,
    registry: AdapterRegistry,
    queues: QueueMap,
}

impl ConnectionWorker {
    fn decrypt(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let parsed = frame::decode(payload)?;
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        Ok(cipher.decrypt(&parsed)?)
    }
}

impl ServerTransport {
    pub async fn new(connections: &[ConnectionConfig], sessions: SessionStore) -> anyhow::Result<Self> {
        let mut workers = HashMap::new();
        let mut listeners = Vec::new();

        for connection in connections {
            let key = connection.key();
            let cipher = connection.encryption.as_ref().map(TunnelCipher::new).transpose()?.map(Arc::new);
            let sink = Arc::new(BindEventSink {
                key,
                cipher: cipher.clone(),
                sessions: sessions.clone(),
            });
            let queues = QueueMap::default();
            let registry = AdapterRegistry::new(sink, queues.clone());

            let listener = match connection.connection_type {
                ConnectionType::Tcp => bind_listener::tcp::spawn(registry.clone(), connection.bind_port).await?,
                ConnectionType::Udp => bind_listener::udp::spawn(registry.clone(), connection.bind_port).await?,
            };
            listeners.push(listener);
            workers.insert(key, ConnectionWorker { cipher, registry, queues });
        }

        Ok(Self { workers, listeners })
    }

    /// Dispatches one message published by a client session. Called
    /// sequentially per session, which keeps per-belong-id order equal to
    /// publish order.
    pub async fn handle_message(&self, topic: ControlTopic, payload: Vec<u8>) {
        let Some(worker) = self.workers.get(&topic.key) else {
            log::debug!("[ServerTransport] dropping message for unconfigured key {}", topic.key);
            return;
        };
        let belong_id = topic.belong_id;

        match topic.transport_type {
            // The edge originates connections; nothing to do for a client's
            // connection announce.
            TransportType::Connection => {}
            TransportType::Message => {
                let chunk = match worker.decrypt(&payload) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("[ServerTransport] decrypt for {belong_id} error: {e}");
                        return;
                    }
                };
                if let Err(e) = worker.registry.write(&belong_id, chunk).await {
                    log::warn!("[ServerTransport] write {belong_id} error: {e} => destroying");
                    worker.registry.destroy(&belong_id).await;
                }
            }
            TransportType::Destroyed => {
                // Flush every pending write before the destroy is queued.
                if let Some(queue) = worker.queues.get(&belong_id) {
                    queue.wait_idle().await;
                }
                worker.registry.destroy(&belong_id).await;
                worker.queues.remove(&belong_id);
            }
        }
    }

    pub async fn shutdown(&self) {
        for listener in &self.listeners {
            listener.abort();
        }
        for worker in self.workers.values() {
            worker.registry.destroy_all().await;
        }
    }
}

struct BindEventSink {
    key: ConnectionKey,
    cipher: Option<Arc<TunnelCipher>>,
    sessions: SessionStore,
}

impl BindEventSink {
    async fn publish(&self, transport_type: TransportType, belong_id: &BelongId, payload: Vec<u8>) -> anyhow::Result<()> {
        let publisher = self
            .sessions
            .get(&self.key)
            .ok_or_else(|| anyhow::anyhow!("no client session for {}", self.key))?;
        publisher.publish(ControlTopic::new(self.key, transport_type, belong_id.clone()), payload).await
    }
}

#[async_trait::async_trait]
impl SocketEventSink for BindEventSink {
    async fn on_connection(&self, belong_id: &BelongId) -> anyhow::Result<()> {
        self.publish(TransportType::Connection, belong_id, Vec::new()).await
    }

    async fn on_data(&self, belong_id: &BelongId, chunk: &[u8]) -> anyhow::Result<()> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        let payload = frame::encode(&cipher.encrypt(chunk)?)?;
        self.publish(TransportType::Message, belong_id, payload).await
    }

    async fn on_destroyed(&self, belong_id: &BelongId) -> anyhow::Result<()> {
        self.publish(TransportType::Destroyed, belong_id, Vec::new()).await
    }
}
