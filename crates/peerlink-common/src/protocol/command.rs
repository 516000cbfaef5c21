//! Command codes of an established stream and the value tag set.

use crate::protocol::error::{PeerlinkError, Result};

macro_rules! commands {
    ($($(#[$doc:meta])* $name:ident = $code:literal,)*) => {
        /// Every command that can start a block on an established stream.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Command {
            $($(#[$doc])* $name = $code,)*
        }

        impl Command {
            pub fn code(self) -> u16 {
                self as u16
            }
        }

        impl TryFrom<u16> for Command {
            type Error = PeerlinkError;

            fn try_from(code: u16) -> Result<Self> {
                match code {
                    $($code => Ok(Command::$name),)*
                    other => Err(PeerlinkError::Protocol(format!("Unknown command: {}", other))),
                }
            }
        }
    };
}

commands! {
    NewInstance = 1,
    MethodCall = 2,
    MethodResult = 3,
    NewInstanceResult = 4,
    MethodResultFail = 5,
    NewInstanceResultFail = 6,
    MethodCallRedispatch = 7,
    GetContextVar = 8,
    GetContextVarResponse = 9,
    NewVariables = 10,
    NewVariablesResult = 11,
    CloseVariables = 12,
    /// Construct a type the caller only knows by name.
    NewInstanceUnknownClass = 13,
    UnknownNewInstanceResult = 14,
    NewInstanceUnknownClassRedispatch = 15,
    NewInstanceRedispatch = 16,
    ReferencesReleased = 17,
    StreamClosed = 18,
    Ping = 19,
    Pong = 20,
    CachedClass = 21,
    CachedMethod = 22,
    CachedConstructor = 23,
    CachedClassLoader = 24,
    CachedField = 25,
    InterruptRequest = 26,
    DirectRequestForbidden = 27,
    MethodCallAsync = 28,
    MethodCallContextVar = 29,
    MethodCallContextVarRedispatch = 30,
    MethodCallContextVarNotFound = 31,
    AsyncResponse = 32,
    MethodCallAsyncWithResponse = 33,
}

impl Command {
    /// Returns `true` for commands answering a pending request of the receiver.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Command::MethodResult
                | Command::NewInstanceResult
                | Command::MethodResultFail
                | Command::NewInstanceResultFail
                | Command::GetContextVarResponse
                | Command::NewVariablesResult
                | Command::UnknownNewInstanceResult
                | Command::Pong
                | Command::DirectRequestForbidden
                | Command::MethodCallContextVarNotFound
        )
    }
}

/// Value tags written before every encoded value.
pub mod tag {
    pub const NULL: u16 = 0;
    pub const BOOLEAN: u16 = 1;
    pub const BYTE: u16 = 2;
    pub const SHORT: u16 = 3;
    pub const INT: u16 = 4;
    pub const LONG: u16 = 5;
    pub const CHAR: u16 = 6;
    pub const FLOAT: u16 = 7;
    pub const DOUBLE: u16 = 8;
    pub const STRING: u16 = 9;
    pub const ARRAY: u16 = 10;
    pub const ENUM: u16 = 11;
    pub const REMOTE: u16 = 12;
    pub const NEW_REMOTE: u16 = 13;
    pub const EXTERNALIZABLE: u16 = 14;
    pub const CLASS: u16 = 15;
    pub const METHOD: u16 = 16;
    pub const CONSTRUCTOR: u16 = 17;
    pub const SERIALIZED: u16 = 18;
    pub const WRAPPER: u16 = 19;
    pub const ARRAY_BYTE: u16 = 20;
    pub const ARRAY_SHORT: u16 = 21;
    pub const ARRAY_INT: u16 = 22;
    pub const ARRAY_LONG: u16 = 23;
    pub const ARRAY_FLOAT: u16 = 24;
    pub const ARRAY_DOUBLE: u16 = 25;
    pub const ARRAY_BOOLEAN: u16 = 26;
    pub const ARRAY_CHAR: u16 = 27;
    pub const CLASSLOADER: u16 = 28;
    pub const FIELD: u16 = 29;
}

/// Sub-tags of an encoded descriptor.
pub mod descriptor_tag {
    /// The descriptor is written in full.
    pub const DETAILS: u16 = 0;
    /// The descriptor is a back-reference into the receiver's cache.
    pub const INDEX: u16 = 1;
    /// The default type-loading context.
    pub const CONTEXT_NULL: u16 = 2;
}

/// Identifier meaning "no request" / "no object" / "no scope".
pub const NO_ID: u32 = 0;

/// Packs the invoker's interrupt state into one integer.
///
/// A negative value means the executing thread was interrupted when the call
/// finished; the magnitude carries how many interrupt requests were delivered to it.
pub fn compress_interrupt_status(interrupted: bool, delivered: u32) -> i32 {
    let delivered = delivered.min(i32::MAX as u32 - 1) as i32;
    if interrupted {
        -delivered - 1
    } else {
        delivered
    }
}

/// Inverse of [`compress_interrupt_status`].
pub fn decompress_interrupt_status(status: i32) -> (bool, u32) {
    if status >= 0 {
        (false, status as u32)
    } else {
        (true, (-(status + 1)) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_round_trip() {
        for code in 1..=33u16 {
            let cmd = Command::try_from(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        assert!(matches!(Command::try_from(0), Err(PeerlinkError::Protocol(_))));
        assert!(matches!(Command::try_from(34), Err(PeerlinkError::Protocol(_))));
    }

    #[test]
    fn test_interrupt_status_compression() {
        assert_eq!(compress_interrupt_status(false, 0), 0);
        assert_eq!(compress_interrupt_status(true, 0), -1);
        assert_eq!(compress_interrupt_status(true, 3), -4);
        assert_eq!(decompress_interrupt_status(-4), (true, 3));
        assert_eq!(decompress_interrupt_status(-1), (true, 0));
        assert_eq!(decompress_interrupt_status(7), (false, 7));
    }
}
