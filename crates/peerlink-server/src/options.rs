use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peerlink_common::transport::handshake::DEFAULT_CONNECTION_TIMEOUT_MS;
use peerlink_common::Result;
use peerlink_connection::{Connection, ConnectionOptions};
use uuid::Uuid;

/// Validation hooks consulted while accepting sockets.
///
/// Every hook accepts by default. A rejected socket is dropped before the
/// handshake; the other rejections answer `ERROR_VALIDATION_FAILED`.
pub trait AcceptPolicy: Send + Sync {
    /// Whether to handshake with a freshly accepted socket.
    fn accept_socket(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Whether `peer` may add a stream to connection `connection_id`.
    fn accept_stream(&self, _peer: SocketAddr, _connection_id: Uuid) -> bool {
        true
    }

    /// Whether `peer` may shut the server down.
    fn accept_shutdown(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Whether `peer` may ping the server.
    fn accept_ping(&self, _peer: SocketAddr) -> bool {
        true
    }
}

/// Policy accepting every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {}

/// Prepares a new connection, typically by publishing context variables.
/// A failure answers `ERROR_SETUP_FAILED`.
pub type ConnectionSetup = Arc<dyn Fn(&Arc<Connection>) -> Result<()> + Send + Sync>;

/// Server configuration.
///
/// # Example
///
/// ```rust
/// use peerlink_server::ServerOptions;
///
/// let options = ServerOptions::default().with_connection_timeout_ms(500);
/// assert_eq!(options.connection_timeout_ms, 500);
/// ```
#[derive(Clone)]
pub struct ServerOptions {
    /// Time a peer has to complete the handshake.
    pub connection_timeout_ms: u64,
    /// Write timeout of established streams. `None` blocks indefinitely.
    pub stream_timeout: Option<Duration>,
    /// Options of every accepted connection.
    pub connection: ConnectionOptions,
    pub policy: Arc<dyn AcceptPolicy>,
    pub setup: Option<ConnectionSetup>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            stream_timeout: None,
            connection: ConnectionOptions::default(),
            policy: Arc::new(AcceptAll),
            setup: None,
        }
    }
}

impl ServerOptions {
    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = Some(timeout);
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    pub fn with_policy(mut self, policy: impl AcceptPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_setup(
        mut self,
        setup: impl Fn(&Arc<Connection>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub(crate) fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("stream_timeout", &self.stream_timeout)
            .field("has_setup", &self.setup.is_some())
            .finish()
    }
}
