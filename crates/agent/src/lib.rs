//! Client side of the burrow tunnel: runs on the private host, keeps an
//! outbound control session per configured connection and dials the local
//! service for every logical connection the edge opens.

use std::{sync::Arc, time::Duration};

use protocol::config::ConnectionConfig;
use rustls::pki_types::CertificateDer;
use tokio::time::sleep;

mod channel;
mod local_tunnel;
mod transport;

pub use channel::{ChannelEvent, ChannelRequester, ControlChannel, DEFAULT_SERVER_PORT, KEEPALIVE_INTERVAL};
pub use transport::ClientTransport;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Drives one configured connection forever: dial the control channel,
/// relay events, and reconnect when the session drops. Local sockets never
/// outlive their session; on disconnect they are torn down, not buffered.
pub async fn run_connection(connection: ConnectionConfig, ca_certs: Vec<CertificateDer<'static>>) {
    loop {
        match ControlChannel::connect(&connection, &ca_certs).await {
            Ok(mut control) => {
                let transport = match ClientTransport::new(connection.clone(), Arc::new(control.requester())) {
                    Ok(transport) => transport,
                    Err(e) => {
                        log::error!("[Agent] {} transport init error: {e}", connection.key());
                        return;
                    }
                };
                log::info!("[Agent] {} session up", connection.key());
                while let Ok(event) = control.recv().await {
                    match event {
                        ChannelEvent::Message { topic, payload } => transport.handle_message(topic, payload).await,
                        ChannelEvent::Disconnected => break,
                    }
                }
                log::warn!("[Agent] {} session ended => closing local sockets", connection.key());
                transport.shutdown().await;
            }
            Err(e) => {
                log::error!("[Agent] {} connect error: {e}", connection.key());
            }
        }
        sleep(RECONNECT_DELAY).await;
    }
}
