//! The trait every object that can be called across a connection implements.

use std::sync::Arc;

use peerlink_common::{MethodDescriptor, Result, TypeDescriptor};

use crate::proxy::Proxy;
use crate::value::{SerializedValue, Value};

/// Shared handle to a callable object, local or remote.
pub type ObjectRef = Arc<dyn RemoteObject>;

/// An object that can be invoked by a peer.
///
/// Local implementations dispatch on the method descriptor themselves;
/// [`Proxy`] implements this trait by forwarding to the remote endpoint.
///
/// # Example
///
/// ```rust
/// use peerlink_common::{MethodDescriptor, PeerlinkError, Result, TypeDescriptor};
/// use peerlink_connection::{RemoteObject, Value};
///
/// struct Counter;
///
/// impl RemoteObject for Counter {
///     fn type_descriptor(&self) -> TypeDescriptor {
///         TypeDescriptor::new("demo.Counter")
///     }
///
///     fn interfaces(&self) -> Vec<TypeDescriptor> {
///         vec![TypeDescriptor::new("demo.Counting")]
///     }
///
///     fn invoke(&self, method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
///         match method.name() {
///             "count" => Ok(Value::Int(42)),
///             other => Err(PeerlinkError::CallFailed(format!("No such method: {other}"))),
///         }
///     }
/// }
/// ```
pub trait RemoteObject: Send + Sync + 'static {
    /// The concrete type of the object.
    fn type_descriptor(&self) -> TypeDescriptor;

    /// Interfaces a peer may call through a proxy of this object.
    fn interfaces(&self) -> Vec<TypeDescriptor>;

    /// Invokes `method` with `args`.
    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value>;

    /// Payload for self-serializing transfer, read back by the external
    /// reader registered for this type.
    fn write_external(&self) -> Option<Vec<u8>> {
        None
    }

    /// Payload for externally serialized transfer.
    fn serialized(&self) -> Option<SerializedValue> {
        None
    }

    /// Constant name if the object is an enum value.
    fn enum_constant(&self) -> Option<String> {
        None
    }

    /// Returns the proxy if this object is one.
    fn as_proxy(&self) -> Option<&Proxy> {
        None
    }
}

/// Identity of an object: the address of its shared allocation.
///
/// Stable for as long as any strong or weak handle to the allocation exists.
pub(crate) fn object_identity(obj: &ObjectRef) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// Returns `true` if `obj` is a proxy for an object on a peer.
pub fn is_remote_object(obj: &ObjectRef) -> bool {
    obj.as_proxy().is_some()
}

/// Returns `true` if both objects live on the same endpoint: both local, or
/// both proxies over the same connection.
pub fn is_same_location(a: &ObjectRef, b: &ObjectRef) -> bool {
    match (a.as_proxy(), b.as_proxy()) {
        (None, None) => true,
        (Some(pa), Some(pb)) => Arc::ptr_eq(pa.scope().connection(), pb.scope().connection()),
        _ => false,
    }
}
