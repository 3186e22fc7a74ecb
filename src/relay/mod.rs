//! WebSocket relay hosting the real-time game tree for multi-device play

pub mod client;
pub mod protocol;
pub mod server;

pub use client::WsDatabase;
pub use protocol::{DbRequest, DbResponse};
pub use server::RelayServer;
