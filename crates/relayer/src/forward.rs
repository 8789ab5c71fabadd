//! TLS-SNI forwarding edge: routes inbound TLS connections to a backend
//! purely by the requested hostname.
//!
//! The ClientHello is inspected before any handshake state is committed; a
//! hostname with no routing entry is dropped without a single forwarded
//! byte. Matched connections are piped full-duplex to `localhost:port`,
//! re-wrapped in TLS (certificate checks off, the target is trusted by
//! configuration) when the backend itself speaks TLS. Tunnel payloads stay
//! opaque end to end.

use std::{io, net::SocketAddr, sync::Arc};

use metrics::{counter, gauge};
use protocol::ConnectionType;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

use crate::metrics::{METRICS_FORWARD_COUNT, METRICS_FORWARD_LIVE, METRICS_FORWARD_REJECT_COUNT};

const PIPE_BUF_LEN: usize = 16 * 1024;
const MAX_TRANSIENT_ERRORS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindInfo {
    pub port: u16,
    pub connection_type: ConnectionType,
    pub domains: Vec<String>,
    pub has_ssl: bool,
}

pub struct ForwardServer {
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    binds: parking_lot::RwLock<Vec<BindInfo>>,
}

impl ForwardServer {
    pub async fn bind(addr: SocketAddr, cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> anyhow::Result<Self> {
        log::info!("[ForwardServer] starting on {addr}");
        let tls_config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;

        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            tls_config: Arc::new(tls_config),
            binds: parking_lot::RwLock::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registers (or replaces) the routing entry for `{port, connection_type}`.
    /// An empty domain list registers nothing.
    pub fn add_domain(&self, port: u16, domains: &[String], connection_type: ConnectionType, has_ssl: bool) {
        if domains.is_empty() {
            return;
        }
        let mut binds = self.binds.write();
        binds.retain(|b| !(b.port == port && b.connection_type == connection_type));
        binds.push(BindInfo {
            port,
            connection_type,
            domains: domains.to_vec(),
            has_ssl,
        });
    }

    pub fn remove_domain(&self, port: u16, connection_type: ConnectionType) {
        self.binds.write().retain(|b| !(b.port == port && b.connection_type == connection_type));
    }

    /// First registered entry whose domain list contains the hostname. An
    /// unspecified hostname never matches.
    pub fn find_bind_info(&self, servername: &str, connection_type: ConnectionType) -> Option<BindInfo> {
        if servername.trim().is_empty() {
            return None;
        }
        self.binds
            .read()
            .iter()
            .find(|b| b.connection_type == connection_type && b.domains.iter().any(|d| d == servername))
            .cloned()
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("[ForwardServer] accept error: {e}");
                    break;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(server, stream, remote).await {
                    log::info!("[ForwardServer] connection {remote} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(server: Arc<ForwardServer>, stream: TcpStream, remote: SocketAddr) -> anyhow::Result<()> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
    let servername = start.client_hello().server_name().unwrap_or_default().to_string();

    let Some(bind) = server.find_bind_info(&servername, ConnectionType::Tcp) else {
        counter!(METRICS_FORWARD_REJECT_COUNT).increment(1);
        log::info!("[ForwardServer] no route for {remote} sni {servername:?} => closing");
        return Ok(());
    };
    log::info!("[ForwardServer] routing {remote} sni {servername:?} to localhost:{}", bind.port);

    let tls_stream = start.into_stream(server.tls_config.clone()).await?;
    counter!(METRICS_FORWARD_COUNT).increment(1);
    gauge!(METRICS_FORWARD_LIVE).increment(1.0);
    let res = forward_to_backend(&bind, tls_stream).await;
    gauge!(METRICS_FORWARD_LIVE).decrement(1.0);
    res
}

async fn forward_to_backend<S>(bind: &BindInfo, inbound: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let backend = TcpStream::connect(("localhost", bind.port)).await?;
    if bind.has_ssl {
        let tls_config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureBackendVerifier))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let backend = connector.connect(ServerName::try_from("localhost")?, backend).await?;
        pipe_streams(inbound, backend).await;
    } else {
        pipe_streams(inbound, backend).await;
    }
    Ok(())
}

/// Full-duplex pipe; ends both legs once either direction finishes.
async fn pipe_streams<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    tokio::select! {
        _ = pipe_leg(&mut a_read, &mut b_write) => {}
        _ = pipe_leg(&mut b_read, &mut a_write) => {}
    }
}

async fn pipe_leg<R, W>(read: &mut R, write: &mut W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUF_LEN];
    let mut transient = 0u32;
    loop {
        match read.read(&mut buf).await {
            Ok(0) => break,
            Ok(len) => {
                transient = 0;
                match write.write_all(&buf[..len]).await {
                    Ok(()) => {}
                    // Broken pipe on one leg: the opposite leg decides when
                    // the tunnel is really over.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(_) => break,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset && transient < MAX_TRANSIENT_ERRORS => {
                transient += 1;
                continue;
            }
            Err(_) => break,
        }
    }
    write.shutdown().await.ok();
}

#[derive(Debug)]
struct InsecureBackendVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureBackendVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
