//! peerlink Client
//!
//! This crate provides the initiating endpoint of peerlink connections:
//! [`connect`] runs the `NEW_CONNECTION` handshake and returns a
//! [`peerlink_connection::Connection`] that dials more streams through
//! [`TcpStreamConnector`] as it needs them. [`ping`] and [`shutdown`] send
//! single handshake requests.

mod client;

pub use client::{connect, ping, shutdown, ClientOptions, TcpStreamConnector};
