use std::sync::Arc;
use std::time::{Duration, Instant};

use peerlink_common::transport::handshake::{self, HandshakeCommand, DEFAULT_CONNECTION_TIMEOUT_MS};
use peerlink_common::transport::tcp;
use peerlink_common::{PeerlinkError, Result};
use peerlink_connection::{Connection, ConnectionOptions, StreamConnector, StreamPair};
use tracing::{debug, info};
use uuid::Uuid;

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    /// Time allowed for connecting and completing each handshake.
    pub connection_timeout_ms: u64,
    /// Options of the established connection.
    pub connection: ConnectionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            connection: ConnectionOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Opens a connection to the server at `addr`.
///
/// The connection dials additional streams to the same address when it
/// wants more.
///
/// # Example
///
/// ```no_run
/// use peerlink_client::{connect, ClientOptions};
///
/// let connection = connect("127.0.0.1:7100", ClientOptions::default())?;
/// println!("ping: {:?}", connection.ping()?);
/// connection.close();
/// # Ok::<(), peerlink_common::PeerlinkError>(())
/// ```
pub fn connect(addr: &str, options: ClientOptions) -> Result<Arc<Connection>> {
    let timeout = options.timeout();
    let mut socket = tcp::connect(addr, timeout)?;
    let version = handshake::initiate(&mut socket, HandshakeCommand::NewConnection, None)?;
    expect_reply(
        handshake::read_reply(&mut socket)?,
        HandshakeCommand::NewConnectionResponse,
    )?;
    let connection_id = handshake::read_connection_id(&mut socket)?;
    tcp::clear_timeouts(&socket)?;
    info!(addr, connection = %connection_id, version, "Connected");

    let connector = TcpStreamConnector {
        addr: addr.to_string(),
        timeout,
        version,
    };
    Connection::new(
        options.connection,
        connection_id,
        version,
        StreamPair::from_tcp(socket)?,
        Some(Arc::new(connector)),
    )
}

/// Pings the server at `addr` with a handshake request and returns the
/// round-trip time.
pub fn ping(addr: &str, timeout: Duration) -> Result<Duration> {
    let start = Instant::now();
    expect_reply(
        handshake::request_reply(addr, timeout, HandshakeCommand::Ping)?,
        HandshakeCommand::Pong,
    )?;
    Ok(start.elapsed())
}

/// Asks the server at `addr` to shut down.
pub fn shutdown(addr: &str, timeout: Duration) -> Result<()> {
    expect_reply(
        handshake::request_reply(addr, timeout, HandshakeCommand::ShutdownServer)?,
        HandshakeCommand::ShutdownServerResponse,
    )
}

/// Dials additional streams with `NEW_STREAM`.
#[derive(Debug, Clone)]
pub struct TcpStreamConnector {
    addr: String,
    timeout: Duration,
    version: u16,
}

impl StreamConnector for TcpStreamConnector {
    fn connect(&self, connection_id: Uuid) -> Result<StreamPair> {
        let mut socket = tcp::connect(&self.addr, self.timeout)?;
        let version =
            handshake::initiate(&mut socket, HandshakeCommand::NewStream, Some(connection_id))?;
        if version != self.version {
            return Err(PeerlinkError::Handshake(format!(
                "Stream negotiated version {} but the connection uses {}",
                version, self.version
            )));
        }
        expect_reply(
            handshake::read_reply(&mut socket)?,
            HandshakeCommand::NewStreamResponse,
        )?;
        tcp::clear_timeouts(&socket)?;
        debug!(addr = %self.addr, connection = %connection_id, "Opened additional stream");
        StreamPair::from_tcp(socket)
    }
}

fn expect_reply(reply: HandshakeCommand, expected: HandshakeCommand) -> Result<()> {
    if reply == expected {
        Ok(())
    } else {
        Err(PeerlinkError::Handshake(format!(
            "Unexpected reply: {:?}",
            reply
        )))
    }
}
