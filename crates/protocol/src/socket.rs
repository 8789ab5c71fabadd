//! Socket handles, the read pump and the per-transport adapter registry.
//!
//! One registry entry owns exactly one local endpoint (a TCP write half or a
//! UDP flow). All writes and the final close are funneled through the
//! entry's task queue, which is what guarantees per-belong-id ordering and
//! write-free teardown.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, UdpSocket},
    task::JoinHandle,
};

use crate::{
    queue::{QueueError, QueueMap},
    sink::SocketEventSink,
    BelongId,
};

/// Idle window for a freshly created socket awaiting its first byte.
pub const FRESH_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle window once a socket has carried tunnel traffic.
pub const ACTIVE_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

const READ_BUF_LEN: usize = 16 * 1024;
/// Consecutive transient read errors tolerated before the socket is treated
/// as dead. A reset that keeps reporting on every read is not transient.
const MAX_TRANSIENT_ERRORS: u32 = 3;

/// The write/close capability over one local endpoint, selected once per
/// belong id at creation.
pub enum SocketHandle {
    Tcp(OwnedWriteHalf),
    Udp {
        socket: Arc<UdpSocket>,
        /// Recorded datagram source for listener-side flows; `None` for
        /// connected client-side flows.
        peer: Option<SocketAddr>,
    },
}

impl SocketHandle {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            SocketHandle::Tcp(write) => match write.write_all(chunk).await {
                // Broken pipe on write is transient: the read side decides
                // whether the connection is really gone.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            },
            SocketHandle::Udp { socket, peer } => {
                let res = match peer {
                    Some(addr) => socket.send_to(chunk, *addr).await,
                    None => socket.send(chunk).await,
                };
                match res {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            SocketHandle::Tcp(write) => match write.shutdown().await {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            // Dropping the last reference closes a UDP flow.
            SocketHandle::Udp { .. } => Ok(()),
        }
    }
}

struct AdapterEntry {
    handle: tokio::sync::Mutex<SocketHandle>,
    queue: Arc<crate::queue::TaskQueue>,
    destroying: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Belong-id indexed socket adapters of one transport instance.
///
/// The event sink and the reply-queue map are fixed at construction;
/// entries churn as logical connections open and close. The queue entry of
/// a belong id outlives its adapter entry by exactly one destroy task and
/// is removed here, so a drained queue is never left behind.
#[derive(Clone)]
pub struct AdapterRegistry {
    sink: Arc<dyn SocketEventSink>,
    queues: QueueMap,
    entries: Arc<RwLock<HashMap<BelongId, Arc<AdapterEntry>>>>,
}

impl AdapterRegistry {
    pub fn new(sink: Arc<dyn SocketEventSink>, queues: QueueMap) -> Self {
        Self {
            sink,
            queues,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn sink(&self) -> Arc<dyn SocketEventSink> {
        self.sink.clone()
    }

    pub fn contains(&self, belong_id: &BelongId) -> bool {
        self.entries.read().contains_key(belong_id)
    }

    pub fn insert(&self, belong_id: BelongId, handle: SocketHandle) -> anyhow::Result<()> {
        let queue = self.queues.get_or_create(&belong_id);
        let mut entries = self.entries.write();
        if entries.contains_key(&belong_id) {
            anyhow::bail!("socket adapter already exists for {belong_id}");
        }
        entries.insert(
            belong_id,
            Arc::new(AdapterEntry {
                handle: tokio::sync::Mutex::new(handle),
                queue,
                destroying: AtomicBool::new(false),
                pump: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Spawns the read pump feeding `read` into the sink and ties its
    /// lifetime to the belong id: when the pump ends, the entry is
    /// destroyed; when the entry is destroyed first, the pump is aborted.
    pub fn spawn_read_pump<R>(&self, belong_id: &BelongId, read: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let registry = self.clone();
        let sink = self.sink.clone();
        let pump_id = belong_id.clone();
        let pump = tokio::spawn(async move {
            pump_reads(read, &pump_id, sink.as_ref()).await;
            // Teardown runs on its own task: destroy aborts the pump handle
            // and must not cancel itself.
            tokio::spawn(async move { registry.destroy(&pump_id).await });
        });

        self.attach_pump(belong_id, pump);
    }

    /// Records the pump task driving a belong id's reads so teardown can
    /// abort it. Aborts the task right away if the entry is already gone.
    pub fn attach_pump(&self, belong_id: &BelongId, pump: JoinHandle<()>) {
        if let Some(entry) = self.entries.read().get(belong_id) {
            *entry.pump.lock() = Some(pump);
        } else {
            pump.abort();
        }
    }

    /// Enqueues a write on the belong id's queue and resolves once the
    /// socket confirmed it. Unknown (already destroyed) belong ids are a
    /// silent no-op.
    pub async fn write(&self, belong_id: &BelongId, chunk: Vec<u8>) -> Result<(), QueueError> {
        let entry = {
            let entries = self.entries.read();
            match entries.get(belong_id) {
                Some(entry) if !entry.destroying.load(Ordering::SeqCst) => entry.clone(),
                _ => return Ok(()),
            }
        };

        let task_entry = entry.clone();
        entry
            .queue
            .run(async move {
                task_entry.handle.lock().await.write(&chunk).await?;
                Ok(())
            })
            .await
    }

    /// Tears one belong id down: drains the queue, closes the handle,
    /// stops the pump, drops the entry and emits `on_destroyed` exactly
    /// once. Safe to call concurrently and for unknown ids.
    pub async fn destroy(&self, belong_id: &BelongId) {
        let entry = match self.entries.read().get(belong_id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        if entry.destroying.swap(true, Ordering::SeqCst) {
            return;
        }

        entry.queue.wait_idle().await;
        let close_entry = entry.clone();
        if let Err(e) = entry
            .queue
            .run(async move {
                close_entry.handle.lock().await.close().await?;
                Ok(())
            })
            .await
        {
            log::warn!("[SocketAdapter] close {belong_id} error: {e}");
        }

        if let Some(pump) = entry.pump.lock().take() {
            pump.abort();
        }
        self.entries.write().remove(belong_id);
        self.queues.remove(belong_id);

        if let Err(e) = self.sink.on_destroyed(belong_id).await {
            log::warn!("[SocketAdapter] destroyed event {belong_id} error: {e}");
        }
    }

    /// Destroys every live entry; used when the owning transport shuts down.
    pub async fn destroy_all(&self) {
        let ids: Vec<BelongId> = self.entries.read().keys().cloned().collect();
        for belong_id in ids {
            self.destroy(&belong_id).await;
        }
    }
}

/// Reads `read` until EOF, fatal error or idle timeout, forwarding each
/// chunk through the sink. The next read is not issued until the previous
/// forward resolved, so at most one forward is outstanding at any time and
/// a slow control channel backpressures the socket instead of buffering.
pub async fn pump_reads<R: AsyncRead + Unpin>(mut read: R, belong_id: &BelongId, sink: &dyn SocketEventSink) {
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut active = false;
    let mut transient = 0u32;

    loop {
        let window = if active { ACTIVE_SOCKET_TIMEOUT } else { FRESH_SOCKET_TIMEOUT };
        let len = match tokio::time::timeout(window, read.read(&mut buf)).await {
            Err(_) => {
                log::info!("[SocketAdapter] {belong_id} idle {}s => closing", window.as_secs());
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(len)) => len,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset && transient < MAX_TRANSIENT_ERRORS => {
                transient += 1;
                continue;
            }
            Ok(Err(e)) => {
                log::warn!("[SocketAdapter] {belong_id} read error: {e}");
                break;
            }
        };

        active = true;
        transient = 0;
        if let Err(e) = sink.on_data(belong_id, &buf[..len]).await {
            log::warn!("[SocketAdapter] {belong_id} forward error: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use test_log::test;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        destroyed: AtomicUsize,
        data: AtomicUsize,
        inflight: AtomicUsize,
        max_inflight: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SocketEventSink for CountingSink {
        async fn on_connection(&self, _belong_id: &BelongId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_data(&self, _belong_id: &BelongId, _chunk: &[u8]) -> anyhow::Result<()> {
            let inflight = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inflight.fetch_max(inflight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(3)).await;
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            self.data.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_destroyed(&self, _belong_id: &BelongId) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("should bind");
        let addr = listener.local_addr().expect("should have addr");
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (accepted.expect("should accept").0, connected.expect("should connect"))
    }

    #[test(tokio::test)]
    async fn destroy_is_idempotent() {
        let sink = Arc::new(CountingSink::default());
        let registry = AdapterRegistry::new(sink.clone(), QueueMap::default());
        let (local, _peer) = tcp_pair().await;
        let (_read, write) = local.into_split();
        let belong_id = BelongId::generate();

        registry
            .insert(belong_id.clone(), SocketHandle::Tcp(write))
            .expect("should insert");

        tokio::join!(registry.destroy(&belong_id), registry.destroy(&belong_id));
        registry.destroy(&belong_id).await;

        assert_eq!(sink.destroyed.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&belong_id));
    }

    #[test(tokio::test)]
    async fn write_to_unknown_belong_id_is_a_noop() {
        let registry = AdapterRegistry::new(Arc::new(CountingSink::default()), QueueMap::default());
        registry.write(&BelongId::generate(), b"data".to_vec()).await.expect("should no-op");
    }

    #[test(tokio::test)]
    async fn no_write_after_destroy() {
        let sink = Arc::new(CountingSink::default());
        let registry = AdapterRegistry::new(sink.clone(), QueueMap::default());
        let (local, mut peer) = tcp_pair().await;
        let (_read, write) = local.into_split();
        let belong_id = BelongId::generate();

        registry
            .insert(belong_id.clone(), SocketHandle::Tcp(write))
            .expect("should insert");
        registry.write(&belong_id, b"before".to_vec()).await.expect("should write");
        registry.destroy(&belong_id).await;
        registry.write(&belong_id, b"after".to_vec()).await.expect("should no-op");

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.expect("should read until fin");
        assert_eq!(received, b"before");
    }

    #[test(tokio::test)]
    async fn duplicate_insert_is_rejected() {
        let registry = AdapterRegistry::new(Arc::new(CountingSink::default()), QueueMap::default());
        let (a, _peer_a) = tcp_pair().await;
        let (b, _peer_b) = tcp_pair().await;
        let belong_id = BelongId::generate();

        registry
            .insert(belong_id.clone(), SocketHandle::Tcp(a.into_split().1))
            .expect("should insert");
        assert!(registry
            .insert(belong_id, SocketHandle::Tcp(b.into_split().1))
            .is_err());
    }

    #[test(tokio::test)]
    async fn pump_forwards_one_chunk_at_a_time() {
        let sink = Arc::new(CountingSink::default());
        let (client, server) = tokio::io::duplex(64);
        let belong_id = BelongId::generate();

        let pump_sink = sink.clone();
        let pump = tokio::spawn(async move {
            pump_reads(server, &belong_id, pump_sink.as_ref()).await;
        });

        let mut writer = client;
        for _ in 0..16 {
            writer.write_all(&[0u8; 48]).await.expect("should write");
        }
        drop(writer);
        pump.await.expect("pump should finish");

        assert!(sink.data.load(Ordering::SeqCst) >= 1);
        assert_eq!(sink.max_inflight.load(Ordering::SeqCst), 1);
    }
}
