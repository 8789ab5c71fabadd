use std::net::{Ipv4Addr, SocketAddr};

use metrics::counter;
use protocol::{
    socket::{AdapterRegistry, SocketHandle},
    BelongId,
};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::metrics::{METRICS_TUNNEL_COUNT, METRICS_TUNNEL_ERROR_COUNT};

/// Accepts edge sockets on one connection's bind port. Each accepted socket
/// gets a fresh belong id and is announced to the client before its first
/// byte is read; a failed announce (client offline) drops the socket instead
/// of queueing it.
pub async fn spawn(registry: AdapterRegistry, bind_port: u16) -> anyhow::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, bind_port))).await?;
    log::info!("[BindTcp] listening on {}", listener.local_addr()?);

    Ok(tokio::spawn(async move {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("[BindTcp] accept error: {e}");
                    break;
                }
            };
            let belong_id = BelongId::generate();
            log::info!("[BindTcp] {remote} connected as {belong_id}");
            counter!(METRICS_TUNNEL_COUNT).increment(1);

            let (read, write) = stream.into_split();
            if let Err(e) = registry.insert(belong_id.clone(), SocketHandle::Tcp(write)) {
                log::error!("[BindTcp] register {belong_id} error: {e}");
                continue;
            }

            let conn_registry = registry.clone();
            tokio::spawn(async move {
                // Announce before pumping so the client dials the local
                // service ahead of the first payload byte.
                if let Err(e) = conn_registry.sink().on_connection(&belong_id).await {
                    counter!(METRICS_TUNNEL_ERROR_COUNT).increment(1);
                    log::warn!("[BindTcp] announce {belong_id} error: {e}");
                    conn_registry.destroy(&belong_id).await;
                    return;
                }
                conn_registry.spawn_read_pump(&belong_id, read);
            });
        }
    }))
}
