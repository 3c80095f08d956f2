#![doc = include_str!("../README.md")]

mod client;
mod config;
mod connection;
mod event;
mod server;

pub mod transport;

#[cfg(feature = "condition")]
pub mod condition;

pub use {
    client::{Client, ClientHandler},
    config::PeerConfig,
    connection::{ClientId, ConnectionState},
    event::{ClientEvent, DisconnectReason, ServerEvent},
    server::{Server, ServerHandler},
};

/// Re-export of the wire protocol crate, for direct access to the message
/// codec types.
pub use riptide_proto as proto;
pub use riptide_proto::msg::{Message, SendMode};
