//! Scopes: paired tables of exposed objects and proxies.
//!
//! A scope exists on both endpoints of a connection, bound to one stream.
//! Each side keeps the objects it exposed to the peer, with the number of
//! references the peer holds, and the proxies it built for the peer's
//! objects, with the number of references it received. A dropped proxy
//! hands its count back to the peer in a release notification; a released
//! local object loses its strong holder and is swept once nothing else
//! keeps it alive.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use peerlink_common::transport::WireWriter;
use peerlink_common::{
    Command, ConstructorDescriptor, ContextId, MethodDescriptor, PeerlinkError, Result,
    TypeDescriptor, NO_ID,
};
use tracing::{debug, info, trace, warn};

use crate::codec::{encode_command, ValueWriter};
use crate::connection::Connection;
use crate::object::{object_identity, ObjectRef, RemoteObject};
use crate::proxy::Proxy;
use crate::request::{serving_request, Response};
use crate::stream::Stream;
use crate::transfer::{MethodProperties, WriterKind};
use crate::value::Value;

struct LocalState {
    strong: Option<ObjectRef>,
    remote_count: u64,
}

struct LocalEntry {
    object: Weak<dyn RemoteObject>,
    state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalTable {
    by_id: HashMap<u32, Arc<LocalEntry>>,
    by_identity: HashMap<usize, u32>,
}

struct ProxyEntry {
    proxy: Weak<Proxy>,
    count: u64,
    serial: u64,
}

struct ScopeState {
    closed: bool,
    aborting: bool,
    notify_peer: bool,
    ongoing: usize,
}

/// Counts one request in flight on a scope.
pub(crate) struct OngoingRequest<'a> {
    scope: &'a Arc<Scope>,
}

impl OngoingRequest<'_> {
    /// Keeps the request counted after the guard is gone; it ends when the
    /// peer acknowledges it.
    fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for OngoingRequest<'_> {
    fn drop(&mut self) {
        self.scope.end_request();
    }
}

/// One side of a scope shared with a peer.
pub struct Scope {
    local_id: u32,
    remote_id: AtomicU32,
    name: Option<String>,
    connection: Arc<Connection>,
    stream: Arc<Stream>,
    state: Mutex<ScopeState>,
    named_refs: AtomicUsize,
    locals: RwLock<LocalTable>,
    next_object_id: AtomicU32,
    proxies: Mutex<HashMap<u32, ProxyEntry>>,
    next_proxy_serial: AtomicU64,
}

impl Scope {
    pub(crate) fn new(
        connection: Arc<Connection>,
        stream: Arc<Stream>,
        local_id: u32,
        remote_id: u32,
        name: Option<String>,
    ) -> Self {
        Self {
            local_id,
            remote_id: AtomicU32::new(remote_id),
            name,
            connection,
            stream,
            state: Mutex::new(ScopeState {
                closed: false,
                aborting: false,
                notify_peer: false,
                ongoing: 0,
            }),
            named_refs: AtomicUsize::new(1),
            locals: RwLock::new(LocalTable::default()),
            next_object_id: AtomicU32::new(1),
            proxies: Mutex::new(HashMap::new()),
            next_proxy_serial: AtomicU64::new(1),
        }
    }

    /// Id of this side of the scope.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Id of the peer's side of the scope.
    pub fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_remote_id(&self, id: u32) {
        self.remote_id.store(id, Ordering::SeqCst);
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns `true` once the scope is closing or closed.
    pub fn is_aborting(&self) -> bool {
        let state = self.state.lock();
        state.aborting || state.closed
    }

    // ---- local objects ----

    /// Registers `obj` as referenced by the peer and returns its id.
    ///
    /// The first exposure allocates an id with a reference count of one;
    /// every further exposure of the same object adds one and restores the
    /// strong holder if a release had dropped it.
    pub fn expose_local_object(&self, obj: &ObjectRef) -> Result<u32> {
        if self.is_closed() {
            return Err(PeerlinkError::Closed(format!("Scope {} closed", self.local_id)));
        }
        let key = object_identity(obj);
        if let Some(id) = self.bump_exposed(key, obj) {
            return Ok(id);
        }

        let mut table = self.locals.write();
        if let Some(&id) = table.by_identity.get(&key) {
            drop(table);
            if let Some(id) = self.bump_exposed(key, obj) {
                return Ok(id);
            }
            return Err(PeerlinkError::TransferFailure(format!(
                "Object {} vanished while being exposed",
                id
            )));
        }
        let id = loop {
            let id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
            if id != NO_ID && !table.by_id.contains_key(&id) {
                break id;
            }
        };
        table.by_id.insert(
            id,
            Arc::new(LocalEntry {
                object: Arc::downgrade(obj),
                state: Mutex::new(LocalState {
                    strong: Some(obj.clone()),
                    remote_count: 1,
                }),
            }),
        );
        table.by_identity.insert(key, id);
        trace!(scope = self.local_id, object = id, "Exposed local object");
        Ok(id)
    }

    fn bump_exposed(&self, key: usize, obj: &ObjectRef) -> Option<u32> {
        let (id, entry) = {
            let table = self.locals.read();
            let id = *table.by_identity.get(&key)?;
            (id, table.by_id.get(&id)?.clone())
        };
        let mut state = entry.state.lock();
        state.remote_count += 1;
        if state.strong.is_none() {
            state.strong = Some(obj.clone());
        }
        Some(id)
    }

    /// Undoes exposures made for a block that was never sent.
    pub(crate) fn rollback_exposures(&self, ids: &[u32]) {
        for &id in ids {
            if let Err(e) = self.references_released(id, 1) {
                debug!(scope = self.local_id, object = id, error = %e, "Failed to roll back exposure");
            }
        }
    }

    /// Looks up an object exposed under `id`.
    pub fn local_object(&self, id: u32) -> Option<ObjectRef> {
        let entry = self.locals.read().by_id.get(&id).cloned()?;
        entry.object.upgrade()
    }

    /// References the peer holds to the object exposed under `id`.
    pub fn local_reference_count(&self, id: u32) -> Option<u64> {
        let entry = self.locals.read().by_id.get(&id).cloned()?;
        let count = entry.state.lock().remote_count;
        Some(count)
    }

    /// Number of entries in the table of exposed objects.
    pub fn local_object_count(&self) -> usize {
        self.locals.read().by_id.len()
    }

    /// Applies a release notification: the peer dropped `count` references.
    ///
    /// At zero the strong holder is dropped; the entry stays until the
    /// object becomes unreachable and is swept.
    pub fn references_released(&self, id: u32, count: u64) -> Result<()> {
        let entry = self.locals.read().by_id.get(&id).cloned().ok_or_else(|| {
            PeerlinkError::TransferFailure(format!("Object not found for id: {}", id))
        })?;
        let mut state = entry.state.lock();
        if count > state.remote_count {
            return Err(PeerlinkError::Protocol(format!(
                "Released {} references to object {} but only {} are held",
                count, id, state.remote_count
            )));
        }
        state.remote_count -= count;
        if state.remote_count == 0 {
            state.strong = None;
        }
        debug!(
            scope = self.local_id,
            object = id,
            released = count,
            remaining = state.remote_count,
            "References released"
        );
        Ok(())
    }

    /// Removes entries whose object is no longer reachable. Returns how
    /// many were removed.
    pub fn sweep_unreachable(&self) -> usize {
        let mut table = self.locals.write();
        let dead: Vec<u32> = table
            .by_id
            .iter()
            .filter(|(_, entry)| entry.object.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            table.by_id.remove(id);
        }
        if !dead.is_empty() {
            table.by_identity.retain(|_, id| !dead.contains(id));
            trace!(scope = self.local_id, swept = dead.len(), "Swept unreachable objects");
        }
        dead.len()
    }

    // ---- proxies ----

    /// Returns the proxy for the peer's object `remote_id`, building one if
    /// none is alive, and counts one more received reference.
    pub(crate) fn proxy_for(
        self: &Arc<Self>,
        remote_id: u32,
        interfaces: Vec<TypeDescriptor>,
    ) -> ObjectRef {
        let mut proxies = self.proxies.lock();
        let carried = match proxies.get_mut(&remote_id) {
            Some(entry) => {
                if let Some(proxy) = entry.proxy.upgrade() {
                    entry.count += 1;
                    return proxy;
                }
                // The old proxy died but its release is still queued.
                entry.count
            }
            None => 0,
        };
        let serial = self.next_proxy_serial.fetch_add(1, Ordering::Relaxed);
        let proxy = Arc::new(Proxy::new(self.clone(), remote_id, serial, interfaces));
        proxies.insert(
            remote_id,
            ProxyEntry {
                proxy: Arc::downgrade(&proxy),
                count: carried + 1,
                serial,
            },
        );
        proxy
    }

    /// Number of live proxies in this scope.
    pub fn proxy_count(&self) -> usize {
        self.proxies
            .lock()
            .values()
            .filter(|entry| entry.proxy.strong_count() > 0)
            .count()
    }

    /// Sends the accumulated reference count of a dropped proxy back to the
    /// peer. Called from the connection's collector thread.
    pub(crate) fn release_proxy(&self, remote_id: u32, serial: u64) {
        let count = {
            let mut proxies = self.proxies.lock();
            match proxies.get(&remote_id) {
                Some(entry) if entry.serial == serial && entry.proxy.strong_count() == 0 => {
                    proxies.remove(&remote_id).map(|entry| entry.count)
                }
                _ => None,
            }
        };
        let Some(count) = count else {
            return;
        };
        if self.is_aborting() {
            return;
        }
        let mut w = WireWriter::with_capacity(18);
        w.write_u16(Command::ReferencesReleased.code());
        w.write_u32(self.remote_id());
        w.write_u32(remote_id);
        w.write_u32(count.min(u32::MAX as u64) as u32);
        match self.stream.send(w.as_slice()) {
            Ok(()) => debug!(scope = self.local_id, object = remote_id, count, "Sent release"),
            Err(e) => debug!(scope = self.local_id, object = remote_id, error = %e, "Failed to send release"),
        }
    }

    // ---- requests ----

    pub(crate) fn begin_request(self: &Arc<Self>) -> Result<OngoingRequest<'_>> {
        let mut state = self.state.lock();
        if state.closed || state.aborting {
            return Err(PeerlinkError::Closed(format!("Scope {} closed", self.local_id)));
        }
        state.ongoing += 1;
        Ok(OngoingRequest { scope: self })
    }

    /// Ends a counted request; finishes a close that waited for it.
    pub(crate) fn end_request(self: &Arc<Self>) {
        let finish = {
            let mut state = self.state.lock();
            state.ongoing = state.ongoing.saturating_sub(1);
            state.aborting && !state.closed && state.ongoing == 0
        };
        if finish {
            self.finish_close();
        }
    }

    fn send_interrupt(&self, request_id: u32) {
        let mut w = WireWriter::with_capacity(6);
        w.write_u16(Command::InterruptRequest.code());
        w.write_u32(request_id);
        if let Err(e) = self.stream.send(w.as_slice()) {
            debug!(request_id, error = %e, "Failed to forward interrupt");
        }
    }

    /// Sends one request of this scope and waits for its answer.
    fn request(
        self: &Arc<Self>,
        command: Command,
        body: impl FnOnce(&mut ValueWriter<'_>, u32) -> Result<()>,
    ) -> Result<Response> {
        let _ongoing = self.begin_request()?;
        let requests = self.connection.requests();
        let pending = requests.new_request(self.stream.serial(), Some(self.clone()))?;
        let id = pending.id();
        let block = encode_command(self, command, |w| body(w, id))?;
        self.stream.send(&block)?;
        requests.wait_response(&pending, || self.send_interrupt(id))
    }

    /// Redispatch id for a request made while serving a peer request on
    /// this connection, or [`NO_ID`].
    fn dispatch_id(&self) -> u32 {
        serving_request(self.connection.serial())
    }

    pub(crate) fn call_method(
        self: &Arc<Self>,
        object_id: u32,
        method: &MethodDescriptor,
        args: &[Value],
        properties: &MethodProperties,
    ) -> Result<Value> {
        check_arity(method.params().len(), args.len(), method)?;
        let dispatch = self.dispatch_id();
        let command = if dispatch == NO_ID {
            Command::MethodCall
        } else {
            Command::MethodCallRedispatch
        };
        let response = self.request(command, |w, id| {
            w.wire().write_u32(id);
            if dispatch != NO_ID {
                w.wire().write_u32(dispatch);
            }
            w.wire().write_u32(self.remote_id());
            w.wire().write_u32(object_id);
            w.write_method(method);
            w.write_args(args, |i| properties.param_writer_for(i))
        })?;
        match response {
            Response::Method { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a call without waiting for its result. The scope counts the
    /// call until the peer acknowledges that it ran.
    pub(crate) fn call_method_async(
        self: &Arc<Self>,
        object_id: u32,
        method: &MethodDescriptor,
        args: &[Value],
        properties: &MethodProperties,
    ) -> Result<()> {
        check_arity(method.params().len(), args.len(), method)?;
        let ongoing = self.begin_request()?;
        let block = encode_command(self, Command::MethodCallAsyncWithResponse, |w| {
            w.wire().write_u32(self.local_id);
            w.wire().write_u32(self.remote_id());
            w.wire().write_u32(object_id);
            w.write_method(method);
            w.write_args(args, |i| properties.param_writer_for(i))
        })?;
        self.stream.send(&block)?;
        ongoing.detach();
        Ok(())
    }

    /// Constructs an object on the peer and returns a proxy for it.
    pub fn new_remote_instance(
        self: &Arc<Self>,
        ctor: &ConstructorDescriptor,
        args: Vec<Value>,
    ) -> Result<ObjectRef> {
        check_arity(ctor.params().len(), args.len(), ctor)?;
        let properties = self.connection.options().transfer_properties.constructor(ctor);
        let dispatch = self.dispatch_id();
        let command = if dispatch == NO_ID {
            Command::NewInstance
        } else {
            Command::NewInstanceRedispatch
        };
        let response = self.request(command, |w, id| {
            w.wire().write_u32(id);
            if dispatch != NO_ID {
                w.wire().write_u32(dispatch);
            }
            w.wire().write_u32(self.remote_id());
            w.write_constructor(ctor);
            w.write_args(&args, |i| properties.param_writer_for(i))
        })?;
        match response {
            Response::NewInstance { object_id, .. } => {
                Ok(self.proxy_for(object_id, vec![ctor.declaring().clone()]))
            }
            other => Err(unexpected(other)),
        }
    }

    /// Constructs an object of a type this side only knows by name.
    ///
    /// The proxy implements the interfaces the peer reports for the new
    /// object.
    pub fn new_remote_instance_by_name(
        self: &Arc<Self>,
        context: Option<&ContextId>,
        type_name: &str,
        param_types: &[&str],
        args: Vec<Value>,
    ) -> Result<ObjectRef> {
        if param_types.len() != args.len() {
            return Err(PeerlinkError::TransferFailure(format!(
                "{} expects {} arguments, got {}",
                type_name,
                param_types.len(),
                args.len()
            )));
        }
        let dispatch = self.dispatch_id();
        let command = if dispatch == NO_ID {
            Command::NewInstanceUnknownClass
        } else {
            Command::NewInstanceUnknownClassRedispatch
        };
        let response = self.request(command, |w, id| {
            w.wire().write_u32(id);
            if dispatch != NO_ID {
                w.wire().write_u32(dispatch);
            }
            w.wire().write_u32(self.remote_id());
            w.write_context(context);
            w.wire().write_str(type_name);
            w.wire().write_u16(param_types.len() as u16);
            for param in param_types {
                w.wire().write_str(param);
            }
            w.write_args(&args, |_| &WriterKind::Default)
        })?;
        match response {
            Response::UnknownNewInstance { object, .. } => match object {
                Value::Object(obj) => Ok(obj),
                other => Err(PeerlinkError::Protocol(format!(
                    "Construction answered with {}",
                    other.kind_name()
                ))),
            },
            other => Err(unexpected(other)),
        }
    }

    /// Calls a static method on the peer.
    ///
    /// Fails with a forbidden error if the peer disallows direct requests.
    pub fn invoke_remote_static(
        self: &Arc<Self>,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value> {
        let properties = self.connection.options().transfer_properties.method(method);
        self.call_method(NO_ID, method, &args, &properties)
    }

    /// Fetches the peer's context variable `name`, or [`Value::Null`] if it
    /// has none.
    pub fn remote_context_variable(self: &Arc<Self>, name: &str) -> Result<Value> {
        let response = self.request(Command::GetContextVar, |w, id| {
            w.wire().write_u32(id);
            w.wire().write_u32(self.remote_id());
            w.wire().write_str(name);
            Ok(())
        })?;
        match response {
            Response::ContextVariable(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Calls `method` on the peer's context variable `name` without
    /// building a proxy for it.
    pub fn invoke_context_variable_method(
        self: &Arc<Self>,
        name: &str,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<Value> {
        check_arity(method.params().len(), args.len(), method)?;
        let properties = self.connection.options().transfer_properties.method(method);
        let dispatch = self.dispatch_id();
        let command = if dispatch == NO_ID {
            Command::MethodCallContextVar
        } else {
            Command::MethodCallContextVarRedispatch
        };
        let response = self.request(command, |w, id| {
            w.wire().write_u32(id);
            w.wire().write_u32(self.remote_id());
            if dispatch != NO_ID {
                w.wire().write_u32(dispatch);
            }
            w.wire().write_str(name);
            w.write_method(method);
            w.write_args(&args, |i| properties.param_writer_for(i))
        })?;
        match response {
            Response::Method { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    // ---- close ----

    /// Releases this handle on the scope.
    ///
    /// A named scope obtained several times stays open until every handle
    /// is closed. The last close tells the peer and tears the scope down as
    /// soon as no request of the scope is in flight.
    pub fn close(self: &Arc<Self>) {
        let Some(name) = self.name.as_deref() else {
            self.begin_close(true);
            return;
        };
        // Held until the scope is aborting, so `named_scope` either adds a
        // handle before the count drops or sees the scope closing.
        let cell = self.connection.named_cell(name);
        let _slot = cell.lock();
        let previous = self
            .named_refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous > 1 {
            debug!(scope = self.local_id, remaining = previous - 1, "Named scope still referenced");
            return;
        }
        self.begin_close(true);
    }

    /// Adds a handle to a named scope. Returns `false` if the scope is
    /// already closing or its last handle is gone.
    pub(crate) fn acquire(&self) -> bool {
        if self.is_aborting() {
            return false;
        }
        self.named_refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n + 1))
            .is_ok()
    }

    /// Closes the scope because the peer closed its side.
    pub(crate) fn close_from_peer(self: &Arc<Self>) {
        self.begin_close(false);
    }

    /// Closes the scope without waiting for requests in flight. Used when
    /// its stream is gone.
    pub(crate) fn abort(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.aborting = true;
            state.notify_peer = false;
        }
        self.finish_close();
    }

    /// Closes the scope as part of closing the whole connection.
    pub(crate) fn close_for_connection(self: &Arc<Self>) {
        self.begin_close(true);
    }

    fn begin_close(self: &Arc<Self>, notify_peer: bool) {
        let finish_now = {
            let mut state = self.state.lock();
            if state.closed || state.aborting {
                return;
            }
            state.aborting = true;
            state.notify_peer = notify_peer;
            state.ongoing == 0
        };
        if finish_now {
            self.finish_close();
        } else {
            debug!(scope = self.local_id, "Scope close deferred until requests finish");
        }
    }

    fn finish_close(self: &Arc<Self>) {
        let notify_peer = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.notify_peer
        };

        if notify_peer && !self.connection.is_closed() && !self.stream.is_closed() {
            let mut w = WireWriter::with_capacity(6);
            w.write_u16(Command::CloseVariables.code());
            w.write_u32(self.remote_id());
            if let Err(e) = self.stream.send(w.as_slice()) {
                warn!(scope = self.local_id, error = %e, "Failed to notify peer of scope close");
            }
        }

        let locals = std::mem::take(&mut *self.locals.write());
        let proxies = std::mem::take(&mut *self.proxies.lock());
        info!(
            scope = self.local_id,
            name = self.name.as_deref().unwrap_or(""),
            exposed = locals.by_id.len(),
            proxies = proxies.len(),
            "Scope closed"
        );
        drop(locals);
        drop(proxies);

        self.connection.scope_closed(self);
    }
}

fn check_arity(expected: usize, actual: usize, what: &dyn fmt::Display) -> Result<()> {
    if expected != actual {
        return Err(PeerlinkError::TransferFailure(format!(
            "{} expects {} arguments, got {}",
            what, expected, actual
        )));
    }
    Ok(())
}

fn unexpected(response: Response) -> PeerlinkError {
    match response {
        Response::Failed { error, .. } => error,
        _ => PeerlinkError::Protocol("Unexpected response kind".to_string()),
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id())
            .field("name", &self.name)
            .field("stream", &self.stream.serial())
            .field("closed", &self.is_closed())
            .finish()
    }
}
