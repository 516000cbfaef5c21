//! Local stand-ins for objects that live on a peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use peerlink_common::{MethodDescriptor, PeerlinkError, Result, TypeDescriptor};
use peerlink_metrics::StatisticsCollector;
use tracing::debug;

use crate::connection::GcEvent;
use crate::object::RemoteObject;
use crate::transfer::MethodProperties;
use crate::value::Value;
use crate::variables::Scope;

/// Type reported by a proxy whose peer exposed no interface.
const UNTYPED_PROXY: &str = "peerlink.Proxy";

/// A proxy for one object of the peer, bound to the scope it came through.
///
/// Calls go through the connection's transfer properties: forbidden
/// methods fail without traffic, cached results are computed once,
/// redirected methods run locally, and RMI failures may fall back to a
/// local implementation or be rethrown as a configured wrapper.
pub struct Proxy {
    scope: Arc<Scope>,
    remote_id: u32,
    serial: u64,
    interfaces: Vec<TypeDescriptor>,
    cached: Mutex<HashMap<MethodDescriptor, Value>>,
}

impl Proxy {
    pub(crate) fn new(
        scope: Arc<Scope>,
        remote_id: u32,
        serial: u64,
        interfaces: Vec<TypeDescriptor>,
    ) -> Self {
        Self {
            scope,
            remote_id,
            serial,
            interfaces,
            cached: Mutex::new(HashMap::new()),
        }
    }

    /// Id of the object in the peer's side of the scope.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Interfaces the peer reported for the object, minus those this side
    /// could not resolve.
    pub fn remote_interfaces(&self) -> &[TypeDescriptor] {
        &self.interfaces
    }

    /// Returns `true` if both proxies stand for the same remote object.
    pub fn is_same_remote(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.scope, &other.scope) && self.remote_id == other.remote_id
    }

    /// Invokes `method` on the remote object.
    pub fn call(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        let properties = self
            .scope
            .connection()
            .options()
            .transfer_properties
            .method(method);
        if properties.forbidden {
            return Err(PeerlinkError::Forbidden(method.to_string()));
        }
        if properties.cache_result {
            if let Some(value) = self.cached.lock().get(method) {
                return Ok(value.clone());
            }
            // Unlocked while dispatching; a callback may call this proxy again.
            let value = self.dispatch(method, args, &properties)?;
            let mut cached = self.cached.lock();
            return Ok(cached.entry(method.clone()).or_insert(value).clone());
        }
        self.dispatch(method, args, &properties)
    }

    /// Invokes `method` without waiting for it to run.
    ///
    /// A redirected method runs locally right away and its result is
    /// dropped.
    pub fn call_async(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<()> {
        let properties = self
            .scope
            .connection()
            .options()
            .transfer_properties
            .method(method);
        if properties.forbidden {
            return Err(PeerlinkError::Forbidden(method.to_string()));
        }
        if let Some(redirect) = &properties.redirect {
            return redirect(self, args).map(|_| ());
        }
        self.scope
            .call_method_async(self.remote_id, method, &args, &properties)
    }

    /// Calls the remote object directly, ignoring redirects, caching and
    /// failure handling.
    pub fn call_remote(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        let properties = self
            .scope
            .connection()
            .options()
            .transfer_properties
            .method(method);
        self.scope
            .call_method(self.remote_id, method, &args, &properties)
    }

    pub(crate) fn call_remote_async(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<()> {
        let properties = self
            .scope
            .connection()
            .options()
            .transfer_properties
            .method(method);
        self.scope
            .call_method_async(self.remote_id, method, &args, &properties)
    }

    fn dispatch(
        &self,
        method: &MethodDescriptor,
        args: Vec<Value>,
        properties: &MethodProperties,
    ) -> Result<Value> {
        if let Some(redirect) = &properties.redirect {
            return redirect(self, args);
        }

        let start = Instant::now();
        let result = self
            .scope
            .call_method(self.remote_id, method, &args, properties);
        if !properties.no_statistics {
            if let Some(statistics) = self.scope.connection().statistics() {
                statistics.record_call(&method.to_string(), start, result.is_ok());
            }
        }

        let failure = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_rmi_failure() => return Err(e),
            Err(e) => e,
        };
        debug!(method = %method, error = %failure, "Remote call failed");

        if let Some(fallback) = &properties.default_on_failure {
            return fallback(self, args).map_err(|error| PeerlinkError::Suppressed {
                error: Box::new(error),
                suppressed: Box::new(failure),
            });
        }
        if let Some(wrapper) = &properties.rethrow {
            return Err(PeerlinkError::Rethrown {
                wrapper: wrapper.clone(),
                source: Box::new(failure),
            });
        }
        match failure {
            PeerlinkError::CallFailed(_) | PeerlinkError::Forbidden(_) => Err(failure),
            other => Err(PeerlinkError::CallFailed(format!("{}: {}", method, other))),
        }
    }
}

impl RemoteObject for Proxy {
    fn type_descriptor(&self) -> TypeDescriptor {
        self.interfaces
            .first()
            .cloned()
            .unwrap_or_else(|| TypeDescriptor::new(UNTYPED_PROXY))
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        self.interfaces.clone()
    }

    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        self.call(method, args)
    }

    fn as_proxy(&self) -> Option<&Proxy> {
        Some(self)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.scope.connection().collect(GcEvent::ProxyDropped {
            scope: self.scope.clone(),
            remote_id: self.remote_id,
            serial: self.serial,
        });
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("scope", &self.scope.local_id())
            .field("remote_id", &self.remote_id)
            .field("interfaces", &self.interfaces)
            .finish()
    }
}
