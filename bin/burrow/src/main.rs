use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Parser, ValueEnum};
use protocol::config::BaseConfig;
use relayer::{Relayer, RelayerConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod tls;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Server,
    Client,
    Both,
}

/// Reverse tunnel exposing private TCP/UDP services through an
/// outbound-only encrypted control channel, with SNI routing at the edge.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which side of the tunnel this process runs
    #[arg(env, long, value_enum, default_value = "server")]
    mode: Mode,

    /// Base configuration file
    #[arg(env, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override configuration files, merged over the base in order
    #[arg(env, long)]
    config_override: Vec<PathBuf>,
}

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    if std::env::var_os("RUST_BACKTRACE").is_none() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    let args: Args = Args::parse();
    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();

    rustls::crypto::ring::default_provider().install_default().expect("should install ring as default");

    let mut layers = vec![args.config.clone()];
    layers.extend(args.config_override.iter().cloned());
    let config = match BaseConfig::load_files(&layers) {
        Ok(config) => config,
        Err(e) => {
            log::error!("config load error: {e:#}");
            std::process::exit(1);
        }
    };

    let (cert_chain, key) = match tls::load_identity(&config.ssl) {
        Ok(identity) => identity,
        Err(e) => {
            log::error!("certificate load error: {e:#}");
            std::process::exit(1);
        }
    };

    let connections = config.connections().to_vec();

    let server_task = if matches!(args.mode, Mode::Server | Mode::Both) {
        let Some(server) = config.server.clone() else {
            log::error!("server mode requires a [server] section in the config");
            std::process::exit(1);
        };
        let cfg = RelayerConfig {
            control_listener: SocketAddr::from((Ipv4Addr::UNSPECIFIED, server.port)),
            forward_listener: SocketAddr::from((Ipv4Addr::UNSPECIFIED, server.forward_server.port)),
            connections: connections.clone(),
            qos: server.qos,
            bind_domains: server.bind_domains.clone(),
            cert_chain: cert_chain.clone(),
            key: key.clone_key(),
        };
        let mut relayer = match Relayer::new(cfg).await {
            Ok(relayer) => relayer,
            Err(e) => {
                log::error!("relayer start error: {e:#}");
                std::process::exit(1);
            }
        };
        Some(tokio::spawn(async move { while relayer.recv().await.is_ok() {} }))
    } else {
        None
    };

    if matches!(args.mode, Mode::Client | Mode::Both) {
        for connection in connections {
            tokio::spawn(agent::run_connection(connection, cert_chain.clone()));
        }
    }

    match server_task {
        Some(task) => {
            task.await.ok();
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
            log::info!("shutdown requested");
        }
    }
}
