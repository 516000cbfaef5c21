//! Accept loop and handshake acceptor.
//!
//! Every accepted socket is handshaken on its own tokio task. A
//! `NEW_CONNECTION` request creates a [`Connection`] on the socket, a
//! `NEW_STREAM` request attaches the socket to a connection created
//! earlier. Once the handshake is done the socket is switched to blocking
//! mode and handed to the connection's stream reader thread.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peerlink_common::transport::handshake::{self, HandshakeCommand};
use peerlink_common::transport::tcp;
use peerlink_common::{PeerlinkError, Result};
use peerlink_connection::{Connection, StreamPair};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::options::ServerOptions;

/// A peerlink server.
///
/// # Example
///
/// ```no_run
/// use peerlink_server::{Server, ServerOptions};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> peerlink_common::Result<()> {
///     let server = Arc::new(Server::bind("127.0.0.1:7100", ServerOptions::default()).await?);
///     server.run().await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

struct Shared {
    options: ServerOptions,
    connections: Mutex<HashMap<Uuid, Weak<Connection>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Server {
    /// Binds the listening socket.
    pub async fn bind(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PeerlinkError::Transport(format!("Failed to bind: {}", e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| PeerlinkError::Transport(format!("Failed to get local address: {}", e)))?;
        info!(addr = %local_addr, "Server listening");
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                options,
                connections: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts sockets until the server is closed, then closes every
    /// connection still alive.
    pub async fn run(&self) -> Result<()> {
        while !self.shared.closed.load(Ordering::Acquire) {
            tokio::select! {
                _ = self.shared.shutdown.notified() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = shared.handle_socket(socket, peer).await {
                                warn!(peer = %peer, error = %e, "Handshake failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept socket");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        self.shared.close();
        info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }

    /// Stops accepting and aborts every live connection.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Connections that are still open.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Asks the server at `addr` to shut down.
    pub fn shutdown_remote(addr: &str, timeout: Duration) -> Result<()> {
        let reply = handshake::request_reply(addr, timeout, HandshakeCommand::ShutdownServer)?;
        expect_reply(reply, HandshakeCommand::ShutdownServerResponse)
    }

    /// Pings the server at `addr` and returns the round-trip time.
    pub fn ping_remote(addr: &str, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let reply = handshake::request_reply(addr, timeout, HandshakeCommand::Ping)?;
        expect_reply(reply, HandshakeCommand::Pong)?;
        Ok(start.elapsed())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
        let connections: Vec<_> = self.connections.lock().drain().collect();
        for (id, connection) in connections {
            if let Some(connection) = connection.upgrade() {
                debug!(connection = %id, "Aborting connection on server close");
                connection.abort();
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) -> Result<()> {
        if !self.options.policy.accept_socket(peer) {
            debug!(peer = %peer, "Socket rejected");
            return Ok(());
        }
        let timeout = self.options.connection_timeout();
        let request = tokio::time::timeout(timeout, handshake::accept(&mut socket))
            .await
            .map_err(|_| PeerlinkError::Timeout(self.options.connection_timeout_ms))??;
        let Some(request) = request else {
            debug!(peer = %peer, "Dropping socket speaking another protocol");
            return Ok(());
        };

        match request.command {
            HandshakeCommand::NewConnection => {
                let executor = Handle::current();
                let socket = into_blocking(socket, self.options.stream_timeout)?;
                let shared = self.clone();
                tokio::task::spawn_blocking(move || {
                    shared.establish(socket, peer, request.version, executor)
                })
                .await
                .map_err(|e| PeerlinkError::Transport(format!("Connection setup failed: {}", e)))?
            }
            HandshakeCommand::NewStream => {
                let id = tokio::time::timeout(timeout, handshake::accept_connection_id(&mut socket))
                    .await
                    .map_err(|_| PeerlinkError::Timeout(self.options.connection_timeout_ms))??;
                self.attach_stream(socket, peer, request.version, id).await
            }
            HandshakeCommand::ShutdownServer => {
                if self.options.policy.accept_shutdown(peer) {
                    info!(peer = %peer, "Shutdown requested");
                    self.close();
                    handshake::reply(&mut socket, HandshakeCommand::ShutdownServerResponse, None).await?;
                } else {
                    debug!(peer = %peer, "Shutdown request rejected");
                    handshake::reply(&mut socket, HandshakeCommand::ErrorValidationFailed, None).await?;
                }
                Ok(())
            }
            HandshakeCommand::Ping => {
                let reply = if self.options.policy.accept_ping(peer) {
                    HandshakeCommand::Pong
                } else {
                    HandshakeCommand::ErrorValidationFailed
                };
                handshake::reply(&mut socket, reply, None).await
            }
            other => {
                debug!(peer = %peer, command = ?other, "Unexpected handshake command");
                handshake::reply(&mut socket, HandshakeCommand::ConnectionRequestFailed, None).await
            }
        }
    }

    /// Creates a connection on a socket that asked for one. Runs on a
    /// blocking thread.
    fn establish(
        self: Arc<Self>,
        socket: std::net::TcpStream,
        peer: SocketAddr,
        version: u16,
        executor: Handle,
    ) -> Result<()> {
        let mut control = socket.try_clone()?;
        if self.closed.load(Ordering::Acquire) {
            return send_reply(&mut control, HandshakeCommand::ConnectionRequestFailed, None);
        }

        let id = Uuid::new_v4();
        let mut options = self.options.connection.clone();
        options.executor.get_or_insert(executor);
        let connection = StreamPair::from_tcp(socket)
            .and_then(|pair| Connection::new(options, id, version, pair, None));
        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Connection setup failed");
                send_reply(&mut control, HandshakeCommand::ErrorSetupFailed, None)?;
                return Err(e);
            }
        };
        if let Some(setup) = &self.options.setup {
            if let Err(e) = setup(&connection) {
                warn!(peer = %peer, connection = %id, error = %e, "Connection setup failed");
                connection.abort();
                send_reply(&mut control, HandshakeCommand::ErrorSetupFailed, None)?;
                return Err(e);
            }
        }

        {
            let mut connections = self.connections.lock();
            connections.retain(|_, c| c.strong_count() > 0);
            connections.insert(id, Arc::downgrade(&connection));
        }
        let shared = Arc::downgrade(&self);
        connection.add_close_listener(move || {
            if let Some(shared) = shared.upgrade() {
                shared.connections.lock().remove(&id);
            }
        });

        send_reply(&mut control, HandshakeCommand::NewConnectionResponse, Some(id))?;
        info!(peer = %peer, connection = %id, version, "Accepted connection");
        Ok(())
    }

    /// Adds a socket that asked for `NEW_STREAM` to its connection.
    async fn attach_stream(
        &self,
        mut socket: TcpStream,
        peer: SocketAddr,
        version: u16,
        id: Uuid,
    ) -> Result<()> {
        let connection = self
            .connections
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .filter(|c| !c.is_aborting());
        let reply = match &connection {
            None => HandshakeCommand::ErrorNoConnection,
            Some(c) if c.protocol_version() != version => HandshakeCommand::ErrorInvalidVersion,
            Some(_) if !self.options.policy.accept_stream(peer, id) => {
                HandshakeCommand::ErrorValidationFailed
            }
            Some(_) => HandshakeCommand::NewStreamResponse,
        };
        handshake::reply(&mut socket, reply, None).await?;
        let Some(connection) = connection.filter(|_| reply == HandshakeCommand::NewStreamResponse)
        else {
            debug!(peer = %peer, connection = %id, reply = ?reply, "Stream refused");
            return Ok(());
        };

        let socket = into_blocking(socket, self.options.stream_timeout)?;
        connection.add_stream(StreamPair::from_tcp(socket)?)?;
        debug!(peer = %peer, connection = %id, "Accepted stream");
        Ok(())
    }
}

/// Switches a handshaken socket to blocking mode for its reader thread.
fn into_blocking(socket: TcpStream, write_timeout: Option<Duration>) -> Result<std::net::TcpStream> {
    let socket = socket.into_std()?;
    socket.set_nonblocking(false)?;
    tcp::configure_stream(&socket)?;
    socket.set_write_timeout(write_timeout)?;
    Ok(socket)
}

fn send_reply(
    socket: &mut std::net::TcpStream,
    command: HandshakeCommand,
    connection_id: Option<Uuid>,
) -> Result<()> {
    socket
        .write_all(&handshake::encode_reply(command, connection_id))
        .and_then(|_| socket.flush())
        .map_err(|e| PeerlinkError::map_io_error(e, "writing handshake reply"))
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
