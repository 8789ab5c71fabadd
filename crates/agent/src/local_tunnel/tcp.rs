use protocol::{
    socket::{AdapterRegistry, SocketHandle},
    BelongId,
};
use tokio::net::TcpStream;

/// Dials the private local service for a fresh belong id and starts its
/// read pump. The peer edge socket already exists, so a dial failure is
/// reported back as a destroy rather than retried.
pub async fn connect(registry: &AdapterRegistry, belong_id: &BelongId, host: &str, port: u16) -> anyhow::Result<()> {
    log::info!("[LocalTcp] {belong_id} connecting {host}:{port}");
    let stream = TcpStream::connect((host, port)).await?;
    let (read, write) = stream.into_split();
    registry.insert(belong_id.clone(), SocketHandle::Tcp(write))?;
    registry.spawn_read_pump(belong_id, read);
    Ok(())
}
