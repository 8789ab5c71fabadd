//! Client-mode socket adapters: one local endpoint per belong id, dialed
//! toward the private service this connection exposes.

pub mod tcp;
pub mod udp;
