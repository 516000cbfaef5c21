use thiserror::Error;

use crate::protocol::failure::RemoteFailure;

/// Errors produced by every layer of a peerlink connection.
///
/// Variants are grouped by how far a failure is allowed to spread:
///
/// - **Transport** (`Io`, `Transport`, `Timeout`): the affected stream is aborted and
///   connection error listeners are notified.
/// - **Protocol** (`Protocol`, `BlockMissing`): fatal to the stream, reported to the
///   caller as a call failure.
/// - **Value transfer** (`TransferFailure`, `Serialization`): scoped to one value or
///   command, never kills the stream.
/// - **Application** (`Application`): the invoked method failed, propagated as is.
/// - **Forbidden** (`Forbidden`): a denied operation, kept distinct from ordinary failures.
#[derive(Error, Debug)]
pub enum PeerlinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Block missing. Current block id: {current} expected: {expected}")]
    BlockMissing { current: u32, expected: u32 },

    #[error("Object transfer failure: {0}")]
    TransferFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("{0}")]
    Application(RemoteFailure),

    #[error("Call forbidden: {0}")]
    Forbidden(String),

    #[error("Call failed: {0}")]
    CallFailed(String),

    #[error("{wrapper}: {source}")]
    Rethrown {
        wrapper: String,
        #[source]
        source: Box<PeerlinkError>,
    },

    /// A fallback failed after the remote call it replaced had failed too.
    #[error("{error} (suppressed: {suppressed})")]
    Suppressed {
        error: Box<PeerlinkError>,
        suppressed: Box<PeerlinkError>,
    },

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl PeerlinkError {
    /// Returns `true` for failures of the underlying byte channel.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PeerlinkError::Io(_) | PeerlinkError::Transport(_) | PeerlinkError::Timeout(_)
        )
    }

    /// Returns `true` for failures that must terminate the stream they occurred on.
    pub fn is_stream_fatal(&self) -> bool {
        self.is_transport()
            || matches!(
                self,
                PeerlinkError::Protocol(_) | PeerlinkError::BlockMissing { .. }
            )
    }

    /// Returns `true` if the operation was refused rather than attempted.
    pub fn is_forbidden(&self) -> bool {
        match self {
            PeerlinkError::Forbidden(_) => true,
            PeerlinkError::Rethrown { source, .. } => source.is_forbidden(),
            _ => false,
        }
    }

    /// Returns `true` for the failure kinds a proxy treats as an RMI failure
    /// (as opposed to an exception raised by the invoked method itself).
    pub fn is_rmi_failure(&self) -> bool {
        !matches!(self, PeerlinkError::Application(_))
    }

    /// Returns the application failure if the remote method itself failed.
    pub fn application_failure(&self) -> Option<&RemoteFailure> {
        match self {
            PeerlinkError::Application(f) => Some(f),
            _ => None,
        }
    }

    /// Maps an I/O error to a transport error, keeping a short context string.
    ///
    /// Timeouts become [`PeerlinkError::Timeout`], broken connections become
    /// [`PeerlinkError::Transport`], everything else is kept as [`PeerlinkError::Io`].
    pub fn map_io_error(err: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => PeerlinkError::Timeout(0),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                PeerlinkError::Transport(format!("Connection lost while {}: {}", context, err))
            }
            _ => PeerlinkError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, PeerlinkError>;
