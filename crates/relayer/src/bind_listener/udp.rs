use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::counter;
use protocol::{
    socket::{AdapterRegistry, SocketHandle, ACTIVE_SOCKET_TIMEOUT},
    BelongId,
};
use tokio::{net::UdpSocket, select, task::JoinHandle};

use crate::metrics::{METRICS_TUNNEL_COUNT, METRICS_TUNNEL_ERROR_COUNT};

const DATAGRAM_BUF_LEN: usize = 64 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Binds one connection's UDP port and demultiplexes datagram flows by
/// source address. Each flow gets a belong id on its first datagram and is
/// swept once the idle window passes without inbound traffic.
pub async fn spawn(registry: AdapterRegistry, bind_port: u16) -> anyhow::Result<JoinHandle<()>> {
    let socket = Arc::new(UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, bind_port))).await?);
    log::info!("[BindUdp] listening on {}", socket.local_addr()?);
    Ok(tokio::spawn(run_flows(socket, registry)))
}

async fn run_flows(socket: Arc<UdpSocket>, registry: AdapterRegistry) {
    let mut flows: HashMap<SocketAddr, (BelongId, Instant)> = HashMap::new();
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut buf = vec![0u8; DATAGRAM_BUF_LEN];

    loop {
        select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    // Datagram-level errors do not invalidate the port.
                    Err(e) => {
                        log::warn!("[BindUdp] recv error: {e}");
                        continue;
                    }
                };

                let existing = flows.get(&peer).map(|(id, _)| id.clone()).filter(|id| registry.contains(id));
                let belong_id = match existing {
                    Some(belong_id) => belong_id,
                    None => {
                        let belong_id = BelongId::generate();
                        log::info!("[BindUdp] {peer} opened flow {belong_id}");
                        counter!(METRICS_TUNNEL_COUNT).increment(1);
                        let handle = SocketHandle::Udp { socket: socket.clone(), peer: Some(peer) };
                        if let Err(e) = registry.insert(belong_id.clone(), handle) {
                            log::error!("[BindUdp] register {belong_id} error: {e}");
                            continue;
                        }
                        belong_id
                    }
                };
                flows.insert(peer, (belong_id.clone(), Instant::now()));

                if let Err(e) = registry.sink().on_data(&belong_id, &buf[..len]).await {
                    counter!(METRICS_TUNNEL_ERROR_COUNT).increment(1);
                    log::warn!("[BindUdp] forward {belong_id} error: {e}");
                    registry.destroy(&belong_id).await;
                    flows.remove(&peer);
                }
            }
            _ = sweep.tick() => {
                let expired: Vec<(SocketAddr, BelongId)> = flows
                    .iter()
                    .filter(|(_, (belong_id, last_seen))| last_seen.elapsed() > ACTIVE_SOCKET_TIMEOUT || !registry.contains(belong_id))
                    .map(|(peer, (belong_id, _))| (*peer, belong_id.clone()))
                    .collect();
                for (peer, belong_id) in expired {
                    flows.remove(&peer);
                    if registry.contains(&belong_id) {
                        log::info!("[BindUdp] flow {belong_id} idle => destroying");
                        registry.destroy(&belong_id).await;
                    }
                }
            }
        }
    }
}
