use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::error::{PeerlinkError, Result};

/// Classifies a failure that crossed the wire in a `*_FAIL` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The invoked method or constructor raised the failure itself.
    Application,
    /// An argument or the result could not be transferred.
    Transfer,
    /// The invocation could not be carried out (unknown object, method, type...).
    Invocation,
}

/// A failure raised on the remote endpoint.
///
/// This is the wire form of an error. Application failures are delivered to the
/// caller unchanged as [`PeerlinkError::Application`], so application code can
/// define its own failure types by name and match on them on the other side.
///
/// # Example
///
/// ```
/// use peerlink_common::protocol::RemoteFailure;
///
/// let failure = RemoteFailure::application("demo.NotFound", "no such key")
///     .with_cause(RemoteFailure::application("io.Error", "disk"));
///
/// assert_eq!(failure.to_string(), "demo.NotFound: no such key");
/// assert_eq!(failure.cause.as_ref().unwrap().type_name, "io.Error");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub type_name: String,
    pub message: String,
    pub cause: Option<Box<RemoteFailure>>,
}

impl RemoteFailure {
    /// Creates an application failure with the given type name and message.
    pub fn application(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            type_name: type_name.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches a cause to this failure.
    pub fn with_cause(mut self, cause: RemoteFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Builds the wire form of a local error.
    ///
    /// Application failures pass through untouched, everything else is flattened
    /// into its message with the matching [`FailureKind`].
    pub fn from_error(err: &PeerlinkError) -> Self {
        match err {
            PeerlinkError::Application(f) => f.clone(),
            PeerlinkError::TransferFailure(msg) => Self {
                kind: FailureKind::Transfer,
                type_name: "peerlink.TransferFailure".to_string(),
                message: msg.clone(),
                cause: None,
            },
            PeerlinkError::Serialization(e) => Self {
                kind: FailureKind::Transfer,
                type_name: "peerlink.TransferFailure".to_string(),
                message: e.to_string(),
                cause: None,
            },
            other => Self {
                kind: FailureKind::Invocation,
                type_name: "peerlink.CallFailed".to_string(),
                message: other.to_string(),
                cause: None,
            },
        }
    }

    /// Converts a received failure back into a local error.
    pub fn into_error(self) -> PeerlinkError {
        match self.kind {
            FailureKind::Application => PeerlinkError::Application(self),
            FailureKind::Transfer => PeerlinkError::TransferFailure(self.message),
            FailureKind::Invocation => PeerlinkError::CallFailed(self.message),
        }
    }

    /// Encodes this failure with postcard.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_stdvec(self)?)
    }

    /// Decodes a failure previously produced by [`RemoteFailure::encode`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(data)?)
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}
