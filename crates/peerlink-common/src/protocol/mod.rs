//! peerlink protocol vocabulary
//!
//! Types shared by both endpoints: reflective descriptors, command and value tag
//! codes, the wire form of remote failures and the error type.

pub mod command;
pub mod descriptor;
pub mod error;
pub mod failure;

pub use command::{
    compress_interrupt_status, decompress_interrupt_status, descriptor_tag, tag, Command, NO_ID,
};
pub use descriptor::{
    ConstructorDescriptor, ContextId, FieldDescriptor, MethodDescriptor, TypeDescriptor,
};
pub use error::{PeerlinkError, Result};
pub use failure::{FailureKind, RemoteFailure};

#[cfg(test)]
mod tests;
