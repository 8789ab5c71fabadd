//! Static tunnel configuration.
//!
//! Loaded once at startup from a layered set of TOML files: built-in
//! defaults, then a base file, then optional override files. Later layers
//! win field-wise; array-valued fields are replaced wholesale, never
//! concatenated. Connection entries are immutable for the process lifetime.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{ClientId, ConnectionKey, ConnectionType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Base64 of a 256-bit AES key.
    pub aes_key: String,
    /// Base64 of a 12-byte GCM IV.
    pub iv: String,
}

/// One tunnel segment: a local service to expose and the remote binding it
/// is reachable at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub server_url: String,
    pub uuid: String,
    pub secret_key: String,
    pub local_host: String,
    pub local_port: u16,
    pub bind_port: u16,
    #[serde(default)]
    pub bind_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionConfig>,
    /// Whether the local service itself speaks TLS.
    #[serde(default)]
    pub has_ssl: bool,
    /// Disabling this accepts any control-server certificate.
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
    #[serde(default)]
    pub qos: u8,
}

impl ConnectionConfig {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            bind_port: self.bind_port,
            connection_type: self.connection_type,
        }
    }

    pub fn client_id(&self) -> ClientId {
        ClientId {
            key: self.key(),
            uuid: self.uuid.clone(),
            secret_key: self.secret_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardServerConfig {
    #[serde(default = "default_forward_port")]
    pub port: u16,
}

impl Default for ForwardServerConfig {
    fn default() -> Self {
        Self { port: default_forward_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub qos: u8,
    /// Domains routed to the control listener itself through the edge.
    #[serde(default)]
    pub bind_domains: Vec<String>,
    #[serde(default)]
    pub forward_server: ForwardServerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default = "default_cert_path")]
    pub certificate: PathBuf,
    #[serde(default = "default_key_path")]
    pub private_key: PathBuf,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            certificate: default_cert_path(),
            private_key: default_key_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub ssl: SslConfig,
}

impl BaseConfig {
    /// Parses and merges raw TOML layers over the built-in defaults.
    pub fn from_layers(layers: &[&str]) -> anyhow::Result<Self> {
        let mut merged = toml::Value::try_from(BaseConfig::default()).expect("defaults should serialize");
        for layer in layers {
            let overlay: toml::Value = toml::from_str(layer).context("invalid config document")?;
            merge_value(&mut merged, overlay);
        }
        let config: BaseConfig = merged.try_into().context("invalid merged config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and merges config files in order. Every listed file must exist;
    /// the caller decides which optional layers to include.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Self> {
        let mut raw = Vec::with_capacity(paths.len());
        for path in paths {
            raw.push(fs::read_to_string(path).with_context(|| format!("read config {}", path.as_ref().display()))?);
        }
        Self::from_layers(&raw.iter().map(String::as_str).collect::<Vec<_>>())
    }

    pub fn connections(&self) -> &[ConnectionConfig] {
        self.client.as_ref().map(|c| c.connections.as_slice()).unwrap_or_default()
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut keys = Vec::new();
        for conn in self.connections() {
            let key = conn.key();
            if keys.contains(&key) {
                anyhow::bail!("duplicate connection key {key}");
            }
            keys.push(key);
            if conn.qos > 2 {
                anyhow::bail!("connection {key}: qos {} out of range", conn.qos);
            }
        }
        if let Some(server) = &self.server {
            if server.qos > 2 {
                anyhow::bail!("server qos {} out of range", server.qos);
            }
        }
        Ok(())
    }
}

/// Tables merge key-wise; every other value, arrays included, is replaced
/// wholesale by the overlay.
fn merge_value(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn default_true() -> bool {
    true
}

fn default_server_port() -> u16 {
    2333
}

fn default_forward_port() -> u16 {
    443
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("ssl/certificate.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("ssl/private.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [server]
        port = 2333
        bind_domains = ["tunnel.example.com"]

        [[client.connections]]
        type = "tcp"
        server_url = "tls://tunnel.example.com:2333"
        uuid = "u-1"
        secret_key = "s-1"
        local_host = "127.0.0.1"
        local_port = 8000
        bind_port = 9000
        bind_domains = ["a.example.com", "b.example.com"]

        [client.connections.encryption]
        aes_key = "a2V5"
        iv = "aXY="
    "#;

    #[test]
    fn parses_base_layer() {
        let config = BaseConfig::from_layers(&[BASE]).expect("should parse");
        let server = config.server.as_ref().expect("should have server");
        assert_eq!(server.port, 2333);
        assert_eq!(server.forward_server.port, 443);

        let conn = &config.connections()[0];
        assert_eq!(conn.key().to_string(), "9000/tcp");
        assert_eq!(conn.client_id().to_string(), "9000/tcp/u-1/s-1");
        assert!(conn.reject_unauthorized);
        assert_eq!(conn.qos, 0);
        assert!(!conn.has_ssl);
    }

    #[test]
    fn override_layer_wins_and_arrays_replace_wholesale() {
        let overlay = r#"
            [server]
            port = 4433
            bind_domains = ["edge.example.net"]
        "#;
        let config = BaseConfig::from_layers(&[BASE, overlay]).expect("should merge");
        let server = config.server.as_ref().expect("should have server");
        assert_eq!(server.port, 4433);
        // Replaced, not concatenated.
        assert_eq!(server.bind_domains, vec!["edge.example.net".to_string()]);
        // Untouched sibling tables survive the merge.
        assert_eq!(config.connections().len(), 1);
    }

    #[test]
    fn connection_arrays_replace_wholesale() {
        let overlay = r#"
            [[client.connections]]
            type = "udp"
            server_url = "tls://tunnel.example.com:2333"
            uuid = "u-2"
            secret_key = "s-2"
            local_host = "127.0.0.1"
            local_port = 5353
            bind_port = 9001
        "#;
        let config = BaseConfig::from_layers(&[BASE, overlay]).expect("should merge");
        let conns = config.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].key().to_string(), "9001/udp");
        assert!(conns[0].encryption.is_none());
    }

    #[test]
    fn rejects_duplicate_connection_keys() {
        let dup = r#"
            [[client.connections]]
            type = "tcp"
            server_url = "tls://x:1"
            uuid = "u-1"
            secret_key = "s-1"
            local_host = "127.0.0.1"
            local_port = 8000
            bind_port = 9000

            [[client.connections]]
            type = "tcp"
            server_url = "tls://x:1"
            uuid = "u-2"
            secret_key = "s-2"
            local_host = "127.0.0.1"
            local_port = 8001
            bind_port = 9000
        "#;
        assert!(BaseConfig::from_layers(&[dup]).is_err());
    }

    #[test]
    fn rejects_out_of_range_qos() {
        let bad = r#"
            [[client.connections]]
            type = "tcp"
            server_url = "tls://x:1"
            uuid = "u"
            secret_key = "s"
            local_host = "127.0.0.1"
            local_port = 8000
            bind_port = 9000
            qos = 3
        "#;
        assert!(BaseConfig::from_layers(&[bad]).is_err());
    }
}
