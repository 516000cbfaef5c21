//! peerlink transport layer
//!
//! Everything below the value codec: block framing of a byte stream, primitive
//! encoding inside blocks, the connection handshake and TCP socket helpers.
//!
//! # Components
//!
//! - **[`BlockWriter`] / [`BlockReader`]**: sequence-numbered, length-prefixed chunks
//! - **[`WireWriter`] / [`WireReader`]**: big-endian primitives inside one block
//! - **[`handshake`]**: fixed-format negotiation before a socket carries blocks
//! - **[`tcp`]**: connect with timeout, socket options
//!
//! # Example
//!
//! ```
//! use peerlink_common::transport::{BlockReader, BlockWriter};
//! use std::io::{Cursor, Write};
//!
//! let mut writer = BlockWriter::new(Vec::new());
//! writer.write_all(b"command").unwrap();
//! writer.seal().unwrap();
//!
//! let mut reader = BlockReader::new(Cursor::new(writer.into_inner()));
//! assert_eq!(reader.read_block().unwrap(), Some(b"command".to_vec()));
//! assert_eq!(reader.read_block().unwrap(), None);
//! ```

pub mod block;
pub mod handshake;
pub mod tcp;
pub mod wire;

pub use block::{BlockReader, BlockWriter, MAX_BLOCK_SIZE, MAX_CHUNK_SIZE};
pub use handshake::{HandshakeCommand, MAGIC, PROTOCOL_VERSION_LATEST};
pub use wire::{WireReader, WireWriter};

#[cfg(test)]
mod tests;
