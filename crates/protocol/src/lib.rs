use std::{fmt::Display, str::FromStr};

use derive_more::derive::{Deref, From};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod control;
pub mod crypto;
pub mod frame;
pub mod queue;
pub mod sink;
pub mod socket;
pub mod topic;

pub use topic::{ClientId, ControlTopic, ProtocolError};

/// Identifier of one logical socket connection multiplexed over a shared
/// control channel. Client-originated for TCP, generated per datagram flow
/// for UDP. Unique within a [`ConnectionKey`] while the connection is open.
#[derive(Debug, Hash, PartialEq, Eq, From, Deref, Clone, Serialize, Deserialize)]
pub struct BelongId(String);

impl BelongId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<&str> for BelongId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for BelongId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Tcp,
    Udp,
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Tcp => f.write_str("tcp"),
            ConnectionType::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for ConnectionType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ConnectionType::Tcp),
            "udp" => Ok(ConnectionType::Udp),
            other => Err(ProtocolError::InvalidConnectionType(other.to_string())),
        }
    }
}

/// The three control-channel message kinds carried per [`BelongId`].
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Connection,
    Message,
    Destroyed,
}

impl Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Connection => f.write_str("connection"),
            TransportType::Message => f.write_str("message"),
            TransportType::Destroyed => f.write_str("destroyed"),
        }
    }
}

impl FromStr for TransportType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connection" => Ok(TransportType::Connection),
            "message" => Ok(TransportType::Message),
            "destroyed" => Ok(TransportType::Destroyed),
            other => Err(ProtocolError::InvalidTransportType(other.to_string())),
        }
    }
}

/// Identifies one configured tunnel segment. Immutable for the process
/// lifetime and unique across all configured connections.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct ConnectionKey {
    pub bind_port: u16,
    pub connection_type: ConnectionType,
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.bind_port, self.connection_type))
    }
}

impl FromStr for ConnectionKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, connection_type) = s.split_once('/').ok_or_else(|| ProtocolError::InvalidConnectionKey(s.to_string()))?;
        Ok(Self {
            bind_port: port.parse().map_err(|_| ProtocolError::InvalidBindPort(port.to_string()))?,
            connection_type: connection_type.parse()?,
        })
    }
}
