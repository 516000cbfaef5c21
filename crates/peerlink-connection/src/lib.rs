//! peerlink Connection Runtime
//!
//! This crate provides the remote invocation runtime shared by both endpoints of a
//! peerlink connection.
//!
//! # Overview
//!
//! Two endpoints call methods on each other's objects through proxies. A connection
//! multiplexes its work over one or more streams; every stream carries block-framed
//! commands. Objects are exposed and proxied inside scopes, which count the references
//! each side holds so an object lives exactly as long as somebody may still call it.
//!
//! # Components
//!
//! - [`Connection`] - Streams, scopes, request correlation and the worker pool
//! - [`Scope`] - Paired tables of exposed objects and proxies, remote calls
//! - [`Proxy`] - Local stand-in for a remote object, honoring [`TransferProperties`]
//! - [`Value`] - Everything that can be passed as an argument or returned
//! - [`TypeRegistry`] - Type-loading contexts, constructors and static methods
//! - [`interrupt`] - Cooperative interruption forwarded across calls
//!
//! # Example
//!
//! ```no_run
//! use peerlink_common::{MethodDescriptor, TypeDescriptor};
//! use peerlink_connection::{Connection, RemoteObject, Value};
//! use std::sync::Arc;
//!
//! fn greet(connection: &Arc<Connection>) -> peerlink_common::Result<Value> {
//!     let scope = connection.new_scope()?;
//!     let greeter = scope.remote_context_variable("greeter")?;
//!     let greet = MethodDescriptor::new(
//!         TypeDescriptor::new("demo.Greeter"),
//!         "greet",
//!         [TypeDescriptor::new("string")],
//!     );
//!     let greeter = greeter.expect_object("greeter")?;
//!     let reply = greeter.invoke(&greet, vec![Value::String("peer".to_string())]);
//!     scope.close();
//!     reply
//! }
//! ```

mod cache;
mod codec;
mod commands;
pub mod connection;
pub mod interrupt;
mod invoke;
pub mod object;
mod options;
mod pool;
pub mod proxy;
pub mod registry;
mod request;
mod stream;
pub mod transfer;
pub mod value;
pub mod variables;

pub use connection::{Connection, ListenerId, StreamConnector};
pub use invoke::{
    invoke_method, invoke_remote_method, invoke_remote_method_async,
    invoke_remote_method_async_or_local,
};
pub use object::{is_remote_object, is_same_location, ObjectRef, RemoteObject};
pub use options::ConnectionOptions;
pub use proxy::Proxy;
pub use registry::{TypeContext, TypeRegistry, Wrapper};
pub use stream::StreamPair;
pub use transfer::{ConstructorProperties, MethodProperties, TransferProperties, WriterKind};
pub use value::{object, SerializedValue, Value};
pub use variables::Scope;

#[cfg(test)]
mod tests;
