//! Server side of the burrow tunnel: the public-facing relayer. Owns the
//! control listener agents dial into, one bind listener per configured
//! connection, and the SNI forward edge.

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{config::ConnectionConfig, topic::ClientId, ConnectionType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::select;

mod bind_listener;
mod control_listener;
mod forward;
pub mod metrics;
mod session;
mod transport;

pub use control_listener::{ControlListener, ControlListenerEvent, SessionPublisher};
pub use forward::{BindInfo, ForwardServer};
pub use session::SessionStore;
pub use transport::ServerTransport;

pub struct RelayerConfig {
    pub control_listener: SocketAddr,
    pub forward_listener: SocketAddr,
    pub connections: Vec<ConnectionConfig>,
    /// Delivery quality for server-originated publishes.
    pub qos: u8,
    /// Domains routing to the control listener itself through the edge.
    pub bind_domains: Vec<String>,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

pub enum RelayerEvent {
    SessionConnected(ClientId),
    SessionDisconnected(ClientId),
    Continue,
}

pub struct Relayer {
    control: ControlListener,
    transport: ServerTransport,
    forward: Arc<ForwardServer>,
}

impl Relayer {
    pub async fn new(cfg: RelayerConfig) -> anyhow::Result<Self> {
        crate::metrics::describe_metrics();

        let sessions = SessionStore::default();
        let transport = ServerTransport::new(&cfg.connections, sessions.clone()).await?;
        let control = ControlListener::new(
            cfg.control_listener,
            cfg.cert_chain.clone(),
            cfg.key.clone_key(),
            &cfg.connections,
            cfg.qos,
            sessions,
        )
        .await?;

        let forward = Arc::new(ForwardServer::bind(cfg.forward_listener, cfg.cert_chain, cfg.key).await?);
        for connection in &cfg.connections {
            forward.add_domain(connection.bind_port, &connection.bind_domains, connection.connection_type, connection.has_ssl);
        }
        // The control listener itself is reachable through the edge under
        // the server's own domains.
        let control_port = control.local_addr()?.port();
        forward.add_domain(control_port, &cfg.bind_domains, ConnectionType::Tcp, true);
        tokio::spawn(forward.clone().run());

        Ok(Self { control, transport, forward })
    }

    pub fn control_addr(&self) -> anyhow::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn forward_addr(&self) -> anyhow::Result<SocketAddr> {
        self.forward.local_addr()
    }

    pub async fn recv(&mut self) -> anyhow::Result<RelayerEvent> {
        select! {
            event = self.control.recv() => match event? {
                ControlListenerEvent::SessionConnected(client_id) => {
                    log::info!("[Relayer] client {client_id} connected");
                    Ok(RelayerEvent::SessionConnected(client_id))
                }
                ControlListenerEvent::Message { topic, payload } => {
                    self.transport.handle_message(topic, payload).await;
                    Ok(RelayerEvent::Continue)
                }
                ControlListenerEvent::SessionDisconnected(client_id) => {
                    log::info!("[Relayer] client {client_id} disconnected");
                    Ok(RelayerEvent::SessionDisconnected(client_id))
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("[Relayer] shutdown in progress");
                self.transport.shutdown().await;
                log::info!("[Relayer] shutdown done");
                Err(anyhow::anyhow!("shutdown requested"))
            }
        }
    }
}
