//! Streams: the byte channels a connection multiplexes its scopes over.
//!
//! Each stream has one reader thread that decodes incoming blocks and a
//! writer shared by every thread sending on it. Writes of whole blocks are
//! serialized by the writer lock, so blocks never interleave.

use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use peerlink_common::transport::{BlockReader, BlockWriter, WireWriter};
use peerlink_common::{Command, PeerlinkError, Result};
use tracing::{debug, info, trace, warn};

use crate::cache::{ReadCache, WriteCache};
use crate::connection::Connection;

type ShutdownFn = Box<dyn Fn() + Send + Sync>;

/// The two halves of an established byte channel.
///
/// The handshake has already happened: everything read from `reader` and
/// written to `writer` is block-framed. `shutdown` must unblock a thread
/// reading from `reader`.
pub struct StreamPair {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    shutdown: ShutdownFn,
    description: String,
}

impl StreamPair {
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            shutdown: Box::new(shutdown),
            description: "custom".to_string(),
        }
    }

    /// Splits a connected socket into a stream pair.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let description = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let writer = stream
            .try_clone()
            .map_err(|e| PeerlinkError::Transport(format!("Failed to clone socket: {}", e)))?;
        let control = stream
            .try_clone()
            .map_err(|e| PeerlinkError::Transport(format!("Failed to clone socket: {}", e)))?;
        Ok(Self {
            reader: Box::new(stream),
            writer: Box::new(writer),
            shutdown: Box::new(move || {
                let _ = control.shutdown(Shutdown::Both);
            }),
            description,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair")
            .field("description", &self.description)
            .finish()
    }
}

struct CountingWriter<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type StreamWriter = BlockWriter<CountingWriter<BufWriter<Box<dyn Write + Send>>>>;

/// One stream of a connection.
pub(crate) struct Stream {
    serial: u64,
    description: String,
    writer: Mutex<StreamWriter>,
    bytes_written: Arc<AtomicU64>,
    shutdown: ShutdownFn,
    write_cache: WriteCache,
    read_cache: ReadCache,
    scope_count: AtomicUsize,
    closed: AtomicBool,
}

impl Stream {
    /// Wraps the writing half of `pair`; the reading half is returned for
    /// the reader thread.
    pub(crate) fn new(serial: u64, pair: StreamPair) -> (Self, Box<dyn Read + Send>) {
        let bytes_written = Arc::new(AtomicU64::new(0));
        let writer = BlockWriter::new(CountingWriter {
            inner: BufWriter::new(pair.writer),
            written: bytes_written.clone(),
        });
        let stream = Self {
            serial,
            description: pair.description,
            writer: Mutex::new(writer),
            bytes_written,
            shutdown: pair.shutdown,
            write_cache: WriteCache::default(),
            read_cache: ReadCache::default(),
            scope_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        (stream, pair.reader)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn write_cache(&self) -> &WriteCache {
        &self.write_cache
    }

    pub(crate) fn read_cache(&self) -> &ReadCache {
        &self.read_cache
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Number of scopes placed on this stream. Changed only under the
    /// connection's stream lock.
    pub(crate) fn scope_count(&self) -> usize {
        self.scope_count.load(Ordering::SeqCst)
    }

    pub(crate) fn add_scope(&self) {
        self.scope_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_scope(&self) {
        let _ = self
            .scope_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes one complete block.
    pub(crate) fn send(&self, block: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(PeerlinkError::Closed(format!("Stream {} closed", self.serial)));
        }
        self.write(block)
    }

    fn write(&self, block: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .write_block(block)
            .map_err(|e| PeerlinkError::map_io_error(e, "writing block"))
    }

    /// Closes the stream. With `notify` the peer is told first, so it
    /// treats the end of the stream as orderly.
    pub(crate) fn close(&self, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if notify {
            let mut w = WireWriter::with_capacity(2);
            w.write_u16(Command::StreamClosed.code());
            if let Err(e) = self.write(w.as_slice()) {
                debug!(stream = self.serial, error = %e, "Failed to announce stream close");
            }
        }
        (self.shutdown)();
    }

    /// Marks the stream closed after the peer announced it. The reader
    /// loop stops after the current block.
    pub(crate) fn mark_closed_by_peer(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Starts the reader thread for this stream.
    pub(crate) fn spawn_reader(
        self: &Arc<Self>,
        connection: Arc<Connection>,
        reader: Box<dyn Read + Send>,
    ) -> Result<()> {
        let stream = self.clone();
        thread::Builder::new()
            .name(format!("peerlink-stream-{}", self.serial))
            .spawn(move || read_loop(connection, stream, reader))
            .map_err(|e| PeerlinkError::Transport(format!("Failed to spawn stream reader: {}", e)))?;
        Ok(())
    }
}

fn read_loop(connection: Arc<Connection>, stream: Arc<Stream>, reader: Box<dyn Read + Send>) {
    info!(stream = stream.serial, peer = %stream.description, "Stream started");
    let mut blocks = BlockReader::new(BufReader::new(reader));

    let outcome = loop {
        match blocks.read_block() {
            Ok(Some(block)) => {
                trace!(stream = stream.serial, len = block.len(), "Received block");
                if let Err(e) = connection.handle_block(&stream, &block) {
                    if e.is_stream_fatal() {
                        break Err(e);
                    }
                    warn!(stream = stream.serial, error = %e, "Failed to handle block");
                }
                if stream.is_closed() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(_) if stream.is_closed() => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match &outcome {
        Ok(()) => info!(stream = stream.serial, "Stream ended"),
        Err(e) => warn!(stream = stream.serial, error = %e, "Stream failed"),
    }
    connection.stream_ended(&stream, outcome);
}
