use std::{io, sync::Arc};

use protocol::{
    sink::SocketEventSink,
    socket::{AdapterRegistry, SocketHandle, ACTIVE_SOCKET_TIMEOUT, FRESH_SOCKET_TIMEOUT},
    BelongId,
};
use tokio::net::UdpSocket;

const DATAGRAM_BUF_LEN: usize = 64 * 1024;

/// Opens a connected datagram flow toward the local service. UDP has no
/// connection phase, so flows are created on demand at the first message
/// and expire once the idle window passes without a reply.
pub async fn open_flow(registry: &AdapterRegistry, belong_id: &BelongId, host: &str, port: u16) -> anyhow::Result<()> {
    log::info!("[LocalUdp] {belong_id} opening flow to {host}:{port}");
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;
    let socket = Arc::new(socket);

    registry.insert(
        belong_id.clone(),
        SocketHandle::Udp {
            socket: socket.clone(),
            peer: None,
        },
    )?;

    let pump_registry = registry.clone();
    let sink = registry.sink();
    let pump_id = belong_id.clone();
    let pump = tokio::spawn(async move {
        pump_flow(socket, &pump_id, sink.as_ref()).await;
        tokio::spawn(async move { pump_registry.destroy(&pump_id).await });
    });
    registry.attach_pump(belong_id, pump);
    Ok(())
}

async fn pump_flow(socket: Arc<UdpSocket>, belong_id: &BelongId, sink: &dyn SocketEventSink) {
    let mut buf = vec![0u8; DATAGRAM_BUF_LEN];
    let mut active = false;
    loop {
        let window = if active { ACTIVE_SOCKET_TIMEOUT } else { FRESH_SOCKET_TIMEOUT };
        let len = match tokio::time::timeout(window, socket.recv(&mut buf)).await {
            Err(_) => {
                log::info!("[LocalUdp] {belong_id} idle {}s => closing flow", window.as_secs());
                break;
            }
            Ok(Ok(len)) => len,
            // ICMP unreachable surfaces as reset/refused on connected sockets.
            Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused) => continue,
            Ok(Err(e)) => {
                log::warn!("[LocalUdp] {belong_id} recv error: {e}");
                break;
            }
        };

        active = true;
        if let Err(e) = sink.on_data(belong_id, &buf[..len]).await {
            log::warn!("[LocalUdp] {belong_id} forward error: {e}");
            break;
        }
    }
}
