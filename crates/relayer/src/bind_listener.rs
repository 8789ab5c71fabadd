//! Server-mode socket adapters: the public bind ports edge traffic enters.

pub mod tcp;
pub mod udp;
