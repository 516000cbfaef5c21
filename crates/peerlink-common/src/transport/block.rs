//! Block framing of a duplex byte stream.
//!
//! A stream is cut into chunks of the form `[u32 block id][u32 payload length][payload]`.
//! A logical block is a run of non-empty chunks sharing one block id, terminated by
//! a chunk of length 0. Block ids start at 1 and increase by one per logical block.
//!
//! ```text
//! [1][5][hello] [1][0] [2][3][abc] [2][0] ...
//!  \_____ block 1 _____/ \____ block 2 ___/
//! ```
//!
//! The writer only emits a block when something was written since the previous
//! seal, so sealing twice in a row (or closing a stream that never wrote) puts
//! nothing on the wire.

use std::io::{self, Read, Write};

use crate::protocol::error::{PeerlinkError, Result};

/// Maximum payload of a single chunk.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum size of a logical block collected by [`BlockReader::read_block`].
///
/// Prevents a misbehaving peer from making the reader allocate without bound.
pub const MAX_BLOCK_SIZE: usize = 100 * 1024 * 1024; // 100 MB

const HEADER_SIZE: usize = 8;

/// Buffers writes and emits them as sealed blocks.
pub struct BlockWriter<W: Write> {
    output: W,
    pending: Vec<u8>,
    block_id: u32,
    chunk_written: bool,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            pending: Vec::new(),
            block_id: 1,
            chunk_written: false,
        }
    }

    /// Id of the block the next write belongs to.
    pub fn current_block_id(&self) -> u32 {
        self.block_id
    }

    /// Writes all of `data` and seals it as one logical block.
    pub fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data)?;
        self.seal()
    }

    /// Terminates the current logical block and flushes the underlying output.
    ///
    /// Does nothing if no bytes were written since the previous seal.
    pub fn seal(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            self.emit_pending()?;
        }
        if !self.chunk_written {
            return Ok(());
        }
        self.write_header(0)?;
        self.block_id = self.block_id.wrapping_add(1);
        self.chunk_written = false;
        self.output.flush()
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    pub fn into_inner(self) -> W {
        self.output
    }

    fn emit_pending(&mut self) -> io::Result<()> {
        let len = self.pending.len();
        self.write_header(len as u32)?;
        self.output.write_all(&self.pending)?;
        self.pending.clear();
        self.chunk_written = true;
        Ok(())
    }

    fn write_header(&mut self, len: u32) -> io::Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&self.block_id.to_be_bytes());
        header[4..].copy_from_slice(&len.to_be_bytes());
        self.output.write_all(&header)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = MAX_CHUNK_SIZE - self.pending.len();
        let n = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..n]);
        if self.pending.len() == MAX_CHUNK_SIZE {
            self.emit_pending()?;
        }
        Ok(n)
    }

    /// Flushing does not seal; only [`BlockWriter::seal`] ends a block.
    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// Cursor over the logical blocks of a framed stream.
///
/// The user advances with [`BlockReader::next_block`]; reading then yields the
/// payload of that block only, returning 0 at its end. Any unread part of an
/// earlier block is skipped when advancing.
pub struct BlockReader<R: Read> {
    input: R,
    next_incoming_block_id: u32,
    user_expected_block_id: u32,
    block_id: u32,
    last_chunk: bool,
    chunk_remaining: usize,
}

impl<R: Read> BlockReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            next_incoming_block_id: 1,
            user_expected_block_id: 0,
            block_id: 0,
            last_chunk: true,
            chunk_remaining: 0,
        }
    }

    /// Moves the cursor to the next logical block.
    pub fn next_block(&mut self) {
        self.user_expected_block_id = self.user_expected_block_id.wrapping_add(1);
    }

    /// Returns `true` if the current block has unread payload.
    pub fn has_remaining(&mut self) -> Result<bool> {
        loop {
            if self.chunk_remaining > 0 {
                return Ok(true);
            }
            if self.last_chunk {
                return Ok(false);
            }
            self.read_chunk_header()?;
        }
    }

    /// Skips whatever is left of the current block.
    pub fn finish_block(&mut self) -> Result<()> {
        while self.has_remaining()? {
            let n = self.chunk_remaining;
            self.skip_exactly(n)?;
            self.chunk_remaining = 0;
        }
        Ok(())
    }

    /// Advances to the next block and reads all of it.
    ///
    /// Returns `Ok(None)` if the stream ended cleanly at a block boundary.
    pub fn read_block(&mut self) -> Result<Option<Vec<u8>>> {
        self.next_block();
        match self.go_to_current_block() {
            Ok(()) => {}
            Err(PeerlinkError::Transport(msg)) if msg == END_OF_STREAM => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut data = Vec::new();
        while self.has_remaining()? {
            let n = self.chunk_remaining;
            if data.len() + n > MAX_BLOCK_SIZE {
                return Err(PeerlinkError::Protocol(format!(
                    "Block too large: more than {} bytes",
                    MAX_BLOCK_SIZE
                )));
            }
            let start = data.len();
            data.resize(start + n, 0);
            self.input
                .read_exact(&mut data[start..])
                .map_err(|e| PeerlinkError::map_io_error(e, "reading block payload"))?;
            self.chunk_remaining = 0;
        }
        Ok(Some(data))
    }

    pub fn get_ref(&self) -> &R {
        &self.input
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    fn go_to_current_block(&mut self) -> Result<()> {
        let expected = self.user_expected_block_id;
        while self.block_id < expected {
            let n = self.chunk_remaining;
            self.skip_exactly(n)?;
            self.chunk_remaining = 0;
            self.read_chunk_header()?;
        }
        if self.block_id != expected {
            return Err(PeerlinkError::BlockMissing {
                current: self.block_id,
                expected,
            });
        }
        Ok(())
    }

    fn read_chunk_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match self.input.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => {
                    return Err(PeerlinkError::Transport(END_OF_STREAM.to_string()));
                }
                Ok(0) => {
                    return Err(PeerlinkError::Transport(
                        "Stream ended inside a block header".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PeerlinkError::map_io_error(e, "reading block header")),
            }
        }
        let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_CHUNK_SIZE {
            return Err(PeerlinkError::Protocol(format!(
                "Invalid payload length: {} (max {})",
                len, MAX_CHUNK_SIZE
            )));
        }
        if id != self.next_incoming_block_id {
            return Err(PeerlinkError::BlockMissing {
                current: id,
                expected: self.next_incoming_block_id,
            });
        }
        self.block_id = id;
        self.chunk_remaining = len;
        if len == 0 {
            self.last_chunk = true;
            self.next_incoming_block_id = self.next_incoming_block_id.wrapping_add(1);
        } else {
            self.last_chunk = false;
        }
        Ok(())
    }

    fn skip_exactly(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let copied = io::copy(&mut (&mut self.input).take(n as u64), &mut io::sink())
            .map_err(|e| PeerlinkError::map_io_error(e, "skipping block payload"))?;
        if copied as usize != n {
            return Err(PeerlinkError::Transport(
                "Stream ended inside a block".to_string(),
            ));
        }
        Ok(())
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.go_to_current_block().map_err(into_io_error)?;
        if !self.has_remaining().map_err(into_io_error)? {
            return Ok(0);
        }
        let n = buf.len().min(self.chunk_remaining);
        let read = self.input.read(&mut buf[..n])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Stream ended inside a block",
            ));
        }
        self.chunk_remaining -= read;
        Ok(read)
    }
}

const END_OF_STREAM: &str = "End of stream";

fn into_io_error(err: PeerlinkError) -> io::Error {
    match err {
        PeerlinkError::Io(e) => e,
        PeerlinkError::Transport(msg) if msg == END_OF_STREAM => {
            io::Error::new(io::ErrorKind::UnexpectedEof, msg)
        }
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}
