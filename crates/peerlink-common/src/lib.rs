//! peerlink Common Types and Transport
//!
//! This crate provides the protocol vocabulary and the low-level transport shared by
//! every peerlink endpoint.
//!
//! # Overview
//!
//! peerlink is a peer-to-peer remote invocation runtime: two endpoints connected by a
//! byte stream call methods on each other's objects through proxies. This crate holds
//! the parts that do not depend on the connection runtime:
//!
//! - **Protocol Layer**: descriptors, command/tag codes, remote failures, errors
//! - **Transport Layer**: block framing, primitive encoding, handshake, TCP helpers
//!
//! # Wire Format
//!
//! - **Handshake**: `[u16 magic 0x7e86][u16 version][u16 command]`, big-endian
//! - **Blocks**: `[u32 block id][u32 payload length][payload]`, a zero-length chunk ends a block
//! - **Commands**: every block starts with a `u16` command code
//!
//! # Components
//!
//! - [`protocol`] - Descriptors, commands, failures and [`PeerlinkError`]
//! - [`transport`] - Block framing, wire primitives, handshake and TCP helpers

pub mod protocol;
pub mod transport;

pub use protocol::*;
