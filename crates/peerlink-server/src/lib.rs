//! peerlink Server
//!
//! This crate provides the accepting endpoint of peerlink connections.
//!
//! The server listens on a TCP socket and runs the handshake on every
//! accepted socket:
//!
//! - `NEW_CONNECTION` creates a connection and answers its 128-bit id
//! - `NEW_STREAM` adds the socket to the connection named by the request
//! - `PING` answers `PONG`
//! - `SHUTDOWN_SERVER` stops the server
//!
//! [`ServerOptions`] configures timeouts, the options of accepted
//! connections, an [`AcceptPolicy`] and a setup hook that typically
//! publishes context variables on each new connection.

mod options;
mod server;

pub use options::{AcceptAll, AcceptPolicy, ConnectionSetup, ServerOptions};
pub use server::Server;
