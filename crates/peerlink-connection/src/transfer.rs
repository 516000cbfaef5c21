//! Transfer properties: how values of a type travel, and how calls to a
//! method behave when made through a proxy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use peerlink_common::{ConstructorDescriptor, MethodDescriptor, Result, TypeDescriptor};

use crate::proxy::Proxy;
use crate::value::Value;

pub type SelectorFn = Arc<dyn Fn(&Value) -> WriterKind + Send + Sync>;
pub type LocalCallFn = Arc<dyn Fn(&Proxy, Vec<Value>) -> Result<Value> + Send + Sync>;

/// How an object value is written.
///
/// Primitives, strings, primitive arrays and values already known to the
/// peer as remote references ignore the kind.
#[derive(Clone, Default)]
pub enum WriterKind {
    /// Enum constants by value, everything else by reference.
    #[default]
    Default,
    /// As an enum constant.
    Enum,
    /// By reference, as a new remote reference.
    Remote,
    /// By reference; fails if the object exposes no interfaces.
    RemoteOnly,
    /// By the object's own external payload.
    SelfSerialize,
    /// As an externally serialized value.
    Serialize,
    /// Array elements are written with the inner kind.
    ArrayComponent(Box<WriterKind>),
    /// Chooses the kind from the value being written.
    Selector(SelectorFn),
    /// Reduced through the wrapper registered for the helper type.
    Wrapper(TypeDescriptor),
}

impl WriterKind {
    pub fn selector(f: impl Fn(&Value) -> WriterKind + Send + Sync + 'static) -> Self {
        WriterKind::Selector(Arc::new(f))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, WriterKind::Default)
    }

    /// Kind used for the elements of an array written with this kind.
    pub(crate) fn component(&self) -> WriterKind {
        match self {
            WriterKind::ArrayComponent(inner) => (**inner).clone(),
            _ => WriterKind::Default,
        }
    }
}

impl fmt::Debug for WriterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterKind::Default => f.write_str("Default"),
            WriterKind::Enum => f.write_str("Enum"),
            WriterKind::Remote => f.write_str("Remote"),
            WriterKind::RemoteOnly => f.write_str("RemoteOnly"),
            WriterKind::SelfSerialize => f.write_str("SelfSerialize"),
            WriterKind::Serialize => f.write_str("Serialize"),
            WriterKind::ArrayComponent(inner) => write!(f, "ArrayComponent({:?})", inner),
            WriterKind::Selector(_) => f.write_str("Selector(..)"),
            WriterKind::Wrapper(ty) => write!(f, "Wrapper({})", ty),
        }
    }
}

/// Per-method invocation and transfer behavior.
#[derive(Clone, Default)]
pub struct MethodProperties {
    pub(crate) forbidden: bool,
    pub(crate) cache_result: bool,
    pub(crate) redirect: Option<LocalCallFn>,
    pub(crate) default_on_failure: Option<LocalCallFn>,
    pub(crate) rethrow: Option<String>,
    pub(crate) return_writer: WriterKind,
    pub(crate) param_writers: Vec<WriterKind>,
    pub(crate) no_statistics: bool,
}

impl MethodProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls through a proxy fail locally without reaching the peer.
    pub fn forbidden(mut self) -> Self {
        self.forbidden = true;
        self
    }

    /// The first successful result is cached on the proxy and returned
    /// for every later call.
    pub fn cache_result(mut self) -> Self {
        self.cache_result = true;
        self
    }

    /// Calls run the local function instead of the remote method.
    pub fn redirect(
        mut self,
        f: impl Fn(&Proxy, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.redirect = Some(Arc::new(f));
        self
    }

    /// When the remote call fails for a non-application reason, the local
    /// function is called instead.
    pub fn default_on_failure(
        mut self,
        f: impl Fn(&Proxy, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.default_on_failure = Some(Arc::new(f));
        self
    }

    /// Non-application failures are rethrown wrapped in `wrapper`.
    pub fn rethrow_as(mut self, wrapper: impl Into<String>) -> Self {
        self.rethrow = Some(wrapper.into());
        self
    }

    pub fn return_writer(mut self, kind: WriterKind) -> Self {
        self.return_writer = kind;
        self
    }

    /// Sets the writer kind of parameter `index`.
    pub fn param_writer(mut self, index: usize, kind: WriterKind) -> Self {
        if self.param_writers.len() <= index {
            self.param_writers.resize(index + 1, WriterKind::Default);
        }
        self.param_writers[index] = kind;
        self
    }

    /// Calls are never recorded in connection statistics.
    pub fn no_statistics(mut self) -> Self {
        self.no_statistics = true;
        self
    }

    pub fn is_forbidden(&self) -> bool {
        self.forbidden
    }

    pub fn is_cached(&self) -> bool {
        self.cache_result
    }

    pub(crate) fn param_writer_for(&self, index: usize) -> &WriterKind {
        param_writer_at(&self.param_writers, index)
    }
}

impl fmt::Debug for MethodProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodProperties")
            .field("forbidden", &self.forbidden)
            .field("cache_result", &self.cache_result)
            .field("redirect", &self.redirect.is_some())
            .field("default_on_failure", &self.default_on_failure.is_some())
            .field("rethrow", &self.rethrow)
            .field("return_writer", &self.return_writer)
            .field("param_writers", &self.param_writers)
            .field("no_statistics", &self.no_statistics)
            .finish()
    }
}

/// Per-constructor parameter writers.
#[derive(Debug, Clone, Default)]
pub struct ConstructorProperties {
    pub(crate) param_writers: Vec<WriterKind>,
}

impl ConstructorProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param_writer(mut self, index: usize, kind: WriterKind) -> Self {
        if self.param_writers.len() <= index {
            self.param_writers.resize(index + 1, WriterKind::Default);
        }
        self.param_writers[index] = kind;
        self
    }

    pub(crate) fn param_writer_for(&self, index: usize) -> &WriterKind {
        param_writer_at(&self.param_writers, index)
    }
}

fn param_writer_at(writers: &[WriterKind], index: usize) -> &WriterKind {
    static DEFAULT: WriterKind = WriterKind::Default;
    writers.get(index).unwrap_or(&DEFAULT)
}

/// The declarative transfer-property table of a connection.
///
/// Lookups return shared entries; descriptors without configuration share
/// one default entry per kind.
///
/// # Example
///
/// ```rust
/// use peerlink_common::{MethodDescriptor, TypeDescriptor};
/// use peerlink_connection::{MethodProperties, TransferProperties, WriterKind};
///
/// let shutdown = MethodDescriptor::new(TypeDescriptor::new("demo.Service"), "shutdown", []);
///
/// let properties = TransferProperties::new()
///     .with_type(TypeDescriptor::new("demo.Color"), WriterKind::Enum)
///     .with_method(shutdown.clone(), MethodProperties::new().forbidden());
///
/// assert!(properties.method(&shutdown).is_forbidden());
/// ```
#[derive(Clone)]
pub struct TransferProperties {
    types: HashMap<TypeDescriptor, WriterKind>,
    methods: HashMap<MethodDescriptor, Arc<MethodProperties>>,
    constructors: HashMap<ConstructorDescriptor, Arc<ConstructorProperties>>,
    default_method: Arc<MethodProperties>,
    default_constructor: Arc<ConstructorProperties>,
}

impl Default for TransferProperties {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferProperties {
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            methods: HashMap::new(),
            constructors: HashMap::new(),
            default_method: Arc::new(MethodProperties::default()),
            default_constructor: Arc::new(ConstructorProperties::default()),
        }
    }

    pub fn with_type(mut self, ty: TypeDescriptor, kind: WriterKind) -> Self {
        self.types.insert(ty, kind);
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor, properties: MethodProperties) -> Self {
        self.methods.insert(method, Arc::new(properties));
        self
    }

    pub fn with_constructor(
        mut self,
        ctor: ConstructorDescriptor,
        properties: ConstructorProperties,
    ) -> Self {
        self.constructors.insert(ctor, Arc::new(properties));
        self
    }

    /// Writer kind configured for a type.
    pub fn type_writer(&self, ty: &TypeDescriptor) -> &WriterKind {
        static DEFAULT: WriterKind = WriterKind::Default;
        self.types.get(ty).unwrap_or(&DEFAULT)
    }

    pub fn method(&self, method: &MethodDescriptor) -> Arc<MethodProperties> {
        self.methods
            .get(method)
            .cloned()
            .unwrap_or_else(|| self.default_method.clone())
    }

    pub fn constructor(&self, ctor: &ConstructorDescriptor) -> Arc<ConstructorProperties> {
        self.constructors
            .get(ctor)
            .cloned()
            .unwrap_or_else(|| self.default_constructor.clone())
    }
}

impl fmt::Debug for TransferProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProperties")
            .field("types", &self.types.len())
            .field("methods", &self.methods.len())
            .field("constructors", &self.constructors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_lookups_share_defaults() {
        let properties = TransferProperties::new();
        let a = MethodDescriptor::new(TypeDescriptor::new("t.A"), "a", []);
        let b = MethodDescriptor::new(TypeDescriptor::new("t.B"), "b", []);

        assert!(Arc::ptr_eq(&properties.method(&a), &properties.method(&b)));
        assert!(properties.type_writer(&TypeDescriptor::new("t.A")).is_default());
    }

    #[test]
    fn test_param_writers_pad_with_default() {
        let properties = MethodProperties::new().param_writer(2, WriterKind::Remote);
        assert!(properties.param_writer_for(0).is_default());
        assert!(matches!(properties.param_writer_for(2), WriterKind::Remote));
        assert!(properties.param_writer_for(7).is_default());
    }

    #[test]
    fn test_array_component_kind() {
        let kind = WriterKind::ArrayComponent(Box::new(WriterKind::Enum));
        assert!(matches!(kind.component(), WriterKind::Enum));
        assert!(WriterKind::Remote.component().is_default());
    }
}
