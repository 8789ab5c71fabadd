//! Capability interface between socket adapters and their transport.
//!
//! A sink is injected when the adapter is constructed and never replaced.
//! Each hook may fail (e.g. the control channel reports the peer offline);
//! the adapter reacts to a failed forward by tearing the belong id down
//! locally instead of buffering.

use crate::{topic::ControlTopic, BelongId};

#[async_trait::async_trait]
pub trait SocketEventSink: Send + Sync + 'static {
    async fn on_connection(&self, belong_id: &BelongId) -> anyhow::Result<()>;
    async fn on_data(&self, belong_id: &BelongId, chunk: &[u8]) -> anyhow::Result<()>;
    async fn on_destroyed(&self, belong_id: &BelongId) -> anyhow::Result<()>;
}

/// One side's handle onto the control channel. Publishing to an offline
/// peer fails immediately; callers react by tearing the belong id down
/// instead of buffering.
#[async_trait::async_trait]
pub trait ControlPublisher: Send + Sync + 'static {
    async fn publish(&self, topic: ControlTopic, payload: Vec<u8>) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}
