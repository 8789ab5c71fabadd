//! Control-channel addressing: publish topics and client session identity.

use std::{fmt::Display, str::FromStr};

use crate::{BelongId, ConnectionKey, TransportType};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid connection type {0}")]
    InvalidConnectionType(String),
    #[error("invalid transport type {0}")]
    InvalidTransportType(String),
    #[error("invalid connection key {0}")]
    InvalidConnectionKey(String),
    #[error("invalid bind port {0}")]
    InvalidBindPort(String),
    #[error("invalid topic {0}")]
    InvalidTopic(String),
    #[error("invalid client id {0}")]
    InvalidClientId(String),
}

/// Address of one control-channel publish:
/// `{bind_port}/{connection_type}/{transport_type}/{belong_id}`.
///
/// Messages whose topic does not parse cannot be attributed to any tunnel
/// segment and are dropped by the receiving transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopic {
    pub key: ConnectionKey,
    pub transport_type: TransportType,
    pub belong_id: BelongId,
}

impl ControlTopic {
    pub fn new(key: ConnectionKey, transport_type: TransportType, belong_id: BelongId) -> Self {
        Self { key, transport_type, belong_id }
    }
}

impl Display for ControlTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}/{}", self.key, self.transport_type, self.belong_id))
    }
}

impl FromStr for ControlTopic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '/');
        let bind_port = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| ProtocolError::InvalidTopic(s.to_string()))?;
        let connection_type = parts.next().ok_or_else(|| ProtocolError::InvalidTopic(s.to_string()))?;
        let transport_type = parts.next().ok_or_else(|| ProtocolError::InvalidTopic(s.to_string()))?;
        let belong_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| ProtocolError::InvalidTopic(s.to_string()))?;

        Ok(Self {
            key: ConnectionKey {
                bind_port: bind_port.parse().map_err(|_| ProtocolError::InvalidBindPort(bind_port.to_string()))?,
                connection_type: connection_type.parse()?,
            },
            transport_type: transport_type.parse()?,
            belong_id: belong_id.into(),
        })
    }
}

/// Identity a client presents when establishing its control session:
/// `{bind_port}/{connection_type}/{uuid}/{secret_key}`.
///
/// The server side resolves this back to a configured connection to pick the
/// matching encryption key; an identity that resolves to nothing is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    pub key: ConnectionKey,
    pub uuid: String,
    pub secret_key: String,
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}/{}", self.key, self.uuid, self.secret_key))
    }
}

impl FromStr for ClientId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '/');
        let bind_port = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| ProtocolError::InvalidClientId(s.to_string()))?;
        let connection_type = parts.next().ok_or_else(|| ProtocolError::InvalidClientId(s.to_string()))?;
        let uuid = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| ProtocolError::InvalidClientId(s.to_string()))?;
        let secret_key = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| ProtocolError::InvalidClientId(s.to_string()))?;

        Ok(Self {
            key: ConnectionKey {
                bind_port: bind_port.parse().map_err(|_| ProtocolError::InvalidBindPort(bind_port.to_string()))?,
                connection_type: connection_type.parse()?,
            },
            uuid: uuid.to_string(),
            secret_key: secret_key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionType;

    #[test]
    fn topic_roundtrip() {
        let topic = ControlTopic::new(
            ConnectionKey {
                bind_port: 9000,
                connection_type: ConnectionType::Tcp,
            },
            TransportType::Message,
            "abc-123".into(),
        );
        let encoded = topic.to_string();
        assert_eq!(encoded, "9000/tcp/message/abc-123");
        assert_eq!(encoded.parse::<ControlTopic>().expect("should parse"), topic);
    }

    #[test]
    fn topic_rejects_missing_parts() {
        assert!("9000/tcp/message".parse::<ControlTopic>().is_err());
        assert!("9000/tcp/message/".parse::<ControlTopic>().is_err());
        assert!("/tcp/message/id".parse::<ControlTopic>().is_err());
        assert!("port/tcp/message/id".parse::<ControlTopic>().is_err());
        assert!("9000/sctp/message/id".parse::<ControlTopic>().is_err());
        assert!("9000/tcp/hello/id".parse::<ControlTopic>().is_err());
    }

    #[test]
    fn client_id_roundtrip() {
        let id = ClientId {
            key: ConnectionKey {
                bind_port: 9000,
                connection_type: ConnectionType::Udp,
            },
            uuid: "u-1".to_string(),
            secret_key: "s3cret".to_string(),
        };
        assert_eq!(id.to_string(), "9000/udp/u-1/s3cret");
        assert_eq!("9000/udp/u-1/s3cret".parse::<ClientId>().expect("should parse"), id);
    }

    #[test]
    fn client_id_rejects_missing_secret() {
        assert!("9000/udp/u-1".parse::<ClientId>().is_err());
        assert!("9000/udp/u-1/".parse::<ClientId>().is_err());
    }
}
