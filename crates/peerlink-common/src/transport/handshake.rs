//! Fixed-format negotiation performed on a raw socket before it carries blocks.
//!
//! The initiator sends `[u16 magic][u16 proposed version][u16 command]` followed by
//! command-specific fields; the acceptor sends `[u16 magic][u16 latest version]` as
//! soon as it accepts, then a single reply command once it has processed the request.
//!
//! | Request | Reply |
//! |---|---|
//! | `NEW_CONNECTION` | `NEW_CONNECTION_RESPONSE` + 128-bit connection id |
//! | `NEW_STREAM` + connection id | `NEW_STREAM_RESPONSE` or an `ERROR_*` code |
//! | `SHUTDOWN_SERVER` | `SHUTDOWN_SERVER_RESPONSE` or `ERROR_VALIDATION_FAILED` |
//! | `PING` | `PONG` or `ERROR_VALIDATION_FAILED` |

use std::io::{Read, Write};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::protocol::error::{PeerlinkError, Result};
use crate::transport::tcp;

/// First two bytes of every handshake message.
pub const MAGIC: u16 = 0x7e86;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION_LATEST: u16 = 1;

/// Oldest protocol version an acceptor still supports.
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Default timeout for connecting and completing the handshake.
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 2000;

macro_rules! handshake_commands {
    ($($name:ident = $code:literal,)*) => {
        /// Handshake command and reply codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum HandshakeCommand {
            $($name = $code,)*
        }

        impl TryFrom<u16> for HandshakeCommand {
            type Error = PeerlinkError;

            fn try_from(code: u16) -> Result<Self> {
                match code {
                    $($code => Ok(HandshakeCommand::$name),)*
                    other => Err(PeerlinkError::Handshake(format!(
                        "Unknown connection command: {}",
                        other
                    ))),
                }
            }
        }
    };
}

handshake_commands! {
    NewConnection = 1,
    NewConnectionResponse = 2,
    NewStream = 3,
    NewStreamResponse = 4,
    ConnectionRequestFailed = 5,
    ShutdownServer = 6,
    ShutdownServerResponse = 7,
    Ping = 8,
    Pong = 9,
    ErrorNoConnection = 10,
    ErrorInvalidVersion = 11,
    ErrorValidationFailed = 12,
    ErrorSetupFailed = 13,
}

impl HandshakeCommand {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Converts an error reply into the matching error, any other reply into itself.
    pub fn into_result(self) -> Result<Self> {
        let reason = match self {
            HandshakeCommand::ErrorNoConnection => "no such connection",
            HandshakeCommand::ErrorInvalidVersion => "invalid protocol version",
            HandshakeCommand::ErrorValidationFailed => "validation failed",
            HandshakeCommand::ErrorSetupFailed => "connection setup failed",
            HandshakeCommand::ConnectionRequestFailed => "connection request failed",
            other => return Ok(other),
        };
        Err(PeerlinkError::Handshake(reason.to_string()))
    }
}

/// Picks the version both endpoints speak.
///
/// The result is `min(remote, latest)`; a remote version of 0 or a result below
/// [`PROTOCOL_VERSION_MIN`] is rejected.
pub fn negotiate_version(remote: u16) -> Result<u16> {
    let version = remote.min(PROTOCOL_VERSION_LATEST);
    if version == 0 {
        return Err(PeerlinkError::Handshake(format!(
            "Invalid version: {:#x}",
            version
        )));
    }
    if version < PROTOCOL_VERSION_MIN {
        return Err(PeerlinkError::Handshake(format!(
            "Unsupported version: {:#x} (minimum {:#x})",
            version, PROTOCOL_VERSION_MIN
        )));
    }
    Ok(version)
}

/// Encodes the initiator's request.
pub fn encode_request(command: HandshakeCommand, connection_id: Option<Uuid>) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + 16);
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION_LATEST.to_be_bytes());
    out.extend_from_slice(&command.code().to_be_bytes());
    if let Some(id) = connection_id {
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Initiator side: sends the request and reads the acceptor's greeting.
///
/// Returns the negotiated version. The caller reads the reply with
/// [`read_reply`] afterwards.
pub fn initiate<S: Read + Write>(
    stream: &mut S,
    command: HandshakeCommand,
    connection_id: Option<Uuid>,
) -> Result<u16> {
    stream
        .write_all(&encode_request(command, connection_id))
        .map_err(|e| PeerlinkError::map_io_error(e, "writing handshake"))?;
    stream
        .flush()
        .map_err(|e| PeerlinkError::map_io_error(e, "flushing handshake"))?;

    let magic = read_u16(stream)?;
    if magic != MAGIC {
        return Err(PeerlinkError::Handshake(format!("Invalid magic: {:#x}", magic)));
    }
    negotiate_version(read_u16(stream)?)
}

/// Runs a handshake made of a single request, like `PING`, against `addr`
/// and returns the reply.
pub fn request_reply(addr: &str, timeout: Duration, command: HandshakeCommand) -> Result<HandshakeCommand> {
    let mut socket = tcp::connect(addr, timeout)?;
    initiate(&mut socket, command, None)?;
    read_reply(&mut socket)
}

/// Reads the acceptor's reply code, turning `ERROR_*` replies into errors.
pub fn read_reply<R: Read>(stream: &mut R) -> Result<HandshakeCommand> {
    HandshakeCommand::try_from(read_u16(stream)?)?.into_result()
}

/// Reads a 128-bit connection id.
pub fn read_connection_id<R: Read>(stream: &mut R) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    stream
        .read_exact(&mut bytes)
        .map_err(|e| PeerlinkError::map_io_error(e, "reading connection id"))?;
    Ok(Uuid::from_bytes(bytes))
}

fn read_u16<R: Read>(stream: &mut R) -> Result<u16> {
    let mut bytes = [0u8; 2];
    stream
        .read_exact(&mut bytes)
        .map_err(|e| PeerlinkError::map_io_error(e, "reading handshake"))?;
    Ok(u16::from_be_bytes(bytes))
}

/// A request as seen by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedRequest {
    pub version: u16,
    pub command: HandshakeCommand,
}

/// Acceptor side: writes the greeting and reads the initiator's request header.
///
/// Returns `Ok(None)` if the peer does not speak this protocol (wrong magic or a
/// version below the minimum); the caller should simply drop the socket.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
) -> Result<Option<AcceptedRequest>> {
    let mut greeting = [0u8; 4];
    greeting[..2].copy_from_slice(&MAGIC.to_be_bytes());
    greeting[2..].copy_from_slice(&PROTOCOL_VERSION_LATEST.to_be_bytes());
    stream.write_all(&greeting).await?;
    stream.flush().await?;

    let magic = stream.read_u16().await?;
    if magic != MAGIC {
        return Ok(None);
    }
    let version = match negotiate_version(stream.read_u16().await?) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let command = HandshakeCommand::try_from(stream.read_u16().await?)?;
    Ok(Some(AcceptedRequest { version, command }))
}

/// Acceptor side: reads the connection id following a `NEW_STREAM` request.
pub async fn accept_connection_id<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Uuid> {
    let mut bytes = [0u8; 16];
    stream.read_exact(&mut bytes).await?;
    Ok(Uuid::from_bytes(bytes))
}

/// Acceptor side: writes a reply code, optionally followed by a connection id.
pub async fn reply<S: AsyncWrite + Unpin>(
    stream: &mut S,
    command: HandshakeCommand,
    connection_id: Option<Uuid>,
) -> Result<()> {
    stream.write_all(&encode_reply(command, connection_id)).await?;
    stream.flush().await?;
    Ok(())
}

/// Encodes an acceptor reply, optionally followed by a connection id.
pub fn encode_reply(command: HandshakeCommand, connection_id: Option<Uuid>) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 16);
    out.extend_from_slice(&command.code().to_be_bytes());
    if let Some(id) = connection_id {
        out.extend_from_slice(id.as_bytes());
    }
    out
}
