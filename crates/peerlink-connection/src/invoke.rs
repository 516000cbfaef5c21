//! Invocation helpers that work on any [`ObjectRef`], local or remote.

use peerlink_common::{MethodDescriptor, PeerlinkError, Result};

use crate::object::ObjectRef;
use crate::value::Value;

fn not_remote(method: &MethodDescriptor) -> PeerlinkError {
    PeerlinkError::CallFailed(format!("Not a remote object: cannot call {} remotely", method))
}

/// Calls `method` on the peer that owns `obj`.
///
/// The call bypasses the method's transfer properties: no redirect, no
/// cached result, no fallback.
///
/// # Errors
///
/// Fails if `obj` is a local object.
pub fn invoke_remote_method(obj: &ObjectRef, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
    let proxy = obj.as_proxy().ok_or_else(|| not_remote(method))?;
    proxy.call_remote(method, args)
}

/// Calls `method` remotely if `obj` is a proxy, otherwise locally.
pub fn invoke_method(obj: &ObjectRef, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
    match obj.as_proxy() {
        Some(proxy) => proxy.call_remote(method, args),
        None => obj.invoke(method, args),
    }
}

/// Sends `method` to the peer that owns `obj` without waiting for it.
pub fn invoke_remote_method_async(
    obj: &ObjectRef,
    method: &MethodDescriptor,
    args: Vec<Value>,
) -> Result<()> {
    let proxy = obj.as_proxy().ok_or_else(|| not_remote(method))?;
    proxy.call_remote_async(method, args)
}

/// Sends `method` asynchronously if `obj` is a proxy; a local object is
/// called right away and the result dropped.
pub fn invoke_remote_method_async_or_local(
    obj: &ObjectRef,
    method: &MethodDescriptor,
    args: Vec<Value>,
) -> Result<()> {
    match obj.as_proxy() {
        Some(proxy) => proxy.call_remote_async(method, args),
        None => obj.invoke(method, args).map(|_| ()),
    }
}
