use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::error::{PeerlinkError, Result};

/// Connects to a remote endpoint for a handshake.
///
/// The address may resolve to several socket addresses; each is tried in turn
/// until one accepts. The returned stream has `timeout` set as its read and write
/// timeout so a silent peer cannot stall the handshake. Callers clear the timeouts
/// with [`clear_timeouts`] once the handshake is done.
///
/// # Errors
///
/// Returns an error if:
/// - The address cannot be resolved
/// - Connecting fails for every resolved address
/// - Socket options cannot be set
pub fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let socket_addrs = addr
        .to_socket_addrs()
        .map_err(|e| PeerlinkError::Transport(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => {
                configure_stream(&stream)?;
                stream
                    .set_read_timeout(Some(timeout))
                    .map_err(|e| PeerlinkError::Transport(format!("Failed to set read timeout: {}", e)))?;
                stream
                    .set_write_timeout(Some(timeout))
                    .map_err(|e| PeerlinkError::Transport(format!("Failed to set write timeout: {}", e)))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(PeerlinkError::Transport(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Applies the socket options every peerlink stream uses.
pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| PeerlinkError::Transport(format!("Failed to set TCP_NODELAY: {}", e)))
}

/// Removes handshake timeouts so the stream can block indefinitely on reads.
pub fn clear_timeouts(stream: &TcpStream) -> Result<()> {
    stream
        .set_read_timeout(None)
        .and_then(|_| stream.set_write_timeout(None))
        .map_err(|e| PeerlinkError::Transport(format!("Failed to clear timeouts: {}", e)))
}
