//! Type-loading contexts.
//!
//! A [`TypeRegistry`] resolves the context ids carried by descriptors and
//! holds what a peer may ask this endpoint to do with a type: construct it,
//! call its static methods, rebuild it from a self-serialized payload or
//! unwrap it from a wrapper.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use peerlink_common::{
    ConstructorDescriptor, ContextId, MethodDescriptor, PeerlinkError, Result, TypeDescriptor,
};

use crate::object::ObjectRef;
use crate::value::Value;

pub type ConstructorFn = Arc<dyn Fn(Vec<Value>) -> Result<ObjectRef> + Send + Sync>;
pub type StaticMethodFn = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;
pub type ExternalReaderFn = Arc<dyn Fn(&TypeDescriptor, &[u8]) -> Result<Value> + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&ObjectRef) -> Result<Value> + Send + Sync>;
pub type ReconstructFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Reduces an object to a transferable value and rebuilds it on the other side.
#[derive(Clone)]
pub struct Wrapper {
    reduce: ReduceFn,
    reconstruct: ReconstructFn,
}

impl Wrapper {
    pub fn new(
        reduce: impl Fn(&ObjectRef) -> Result<Value> + Send + Sync + 'static,
        reconstruct: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reduce: Arc::new(reduce),
            reconstruct: Arc::new(reconstruct),
        }
    }

    pub fn reduce(&self, obj: &ObjectRef) -> Result<Value> {
        (self.reduce)(obj)
    }

    pub fn reconstruct(&self, value: Value) -> Result<Value> {
        (self.reconstruct)(value)
    }
}

type SignatureKey = (String, Vec<String>);

fn signature_key<'a>(name: &str, params: impl IntoIterator<Item = &'a TypeDescriptor>) -> SignatureKey {
    (
        name.to_string(),
        params.into_iter().map(|p| p.name().to_string()).collect(),
    )
}

/// One type-loading context: a namespace of type names.
///
/// An open context resolves every name. A strict context only resolves
/// names that were declared, either explicitly or by registering something
/// for them.
#[derive(Clone, Default)]
pub struct TypeContext {
    id: Option<ContextId>,
    strict: bool,
    types: HashSet<String>,
    constructors: HashMap<SignatureKey, ConstructorFn>,
    static_methods: HashMap<(String, SignatureKey), StaticMethodFn>,
    external_readers: HashMap<String, ExternalReaderFn>,
    wrappers: HashMap<String, Wrapper>,
    super_interfaces: HashMap<String, Vec<String>>,
}

impl TypeContext {
    /// Creates an open context with the given id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: Some(ContextId::new(id)),
            ..Self::default()
        }
    }

    fn default_context() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&ContextId> {
        self.id.as_ref()
    }

    /// Only declared type names resolve in this context.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Declares a type name.
    pub fn declare_type(mut self, name: impl Into<String>) -> Self {
        self.types.insert(name.into());
        self
    }

    /// Registers a constructor a peer may call.
    pub fn constructor<F>(mut self, ty: &str, params: &[&str], f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<ObjectRef> + Send + Sync + 'static,
    {
        self.types.insert(ty.to_string());
        let key = (
            ty.to_string(),
            params.iter().map(|p| p.to_string()).collect(),
        );
        self.constructors.insert(key, Arc::new(f));
        self
    }

    /// Registers a static method a peer may call.
    pub fn static_method<F>(mut self, ty: &str, name: &str, params: &[&str], f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.types.insert(ty.to_string());
        let key = (
            ty.to_string(),
            (
                name.to_string(),
                params.iter().map(|p| p.to_string()).collect(),
            ),
        );
        self.static_methods.insert(key, Arc::new(f));
        self
    }

    /// Registers the reader that rebuilds self-serialized values of `ty`.
    pub fn external_reader<F>(mut self, ty: &str, f: F) -> Self
    where
        F: Fn(&TypeDescriptor, &[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        self.types.insert(ty.to_string());
        self.external_readers.insert(ty.to_string(), Arc::new(f));
        self
    }

    /// Registers a wrapper under the name of its helper type.
    pub fn wrapper(mut self, helper: &str, wrapper: Wrapper) -> Self {
        self.types.insert(helper.to_string());
        self.wrappers.insert(helper.to_string(), wrapper);
        self
    }

    /// Records that `ty` extends each of `supers`.
    pub fn super_interfaces(mut self, ty: &str, supers: &[&str]) -> Self {
        self.types.insert(ty.to_string());
        for s in supers {
            self.types.insert(s.to_string());
        }
        self.super_interfaces
            .entry(ty.to_string())
            .or_default()
            .extend(supers.iter().map(|s| s.to_string()));
        self
    }

    fn knows(&self, name: &str) -> bool {
        !self.strict || self.types.contains(name)
    }

    /// Returns `true` if `ancestor` is a strict super-interface of `ty`.
    fn extends(&self, ty: &str, ancestor: &str) -> bool {
        let mut stack: Vec<&str> = vec![ty];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(supers) = self.super_interfaces.get(current) {
                for s in supers {
                    if s == ancestor {
                        return true;
                    }
                    stack.push(s);
                }
            }
        }
        false
    }
}

impl fmt::Debug for TypeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeContext")
            .field("id", &self.id)
            .field("strict", &self.strict)
            .field("types", &self.types.len())
            .field("constructors", &self.constructors.len())
            .field("static_methods", &self.static_methods.len())
            .finish()
    }
}

/// Resolves context ids to [`TypeContext`]s.
///
/// The default context (no id) always exists. Descriptors naming an
/// unregistered context id fail to resolve with a transfer failure.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    default: TypeContext,
    contexts: HashMap<ContextId, TypeContext>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            default: TypeContext::default_context(),
            contexts: HashMap::new(),
        }
    }

    /// Replaces the default context's registrations.
    ///
    /// The id of `context` is ignored.
    pub fn with_default(mut self, context: TypeContext) -> Self {
        self.default = TypeContext { id: None, ..context };
        self
    }

    /// Adds a context. A context without id replaces the default one.
    pub fn with_context(mut self, context: TypeContext) -> Self {
        match context.id.clone() {
            Some(id) => {
                self.contexts.insert(id, context);
            }
            None => self.default = context,
        }
        self
    }

    /// Looks up a context by id.
    pub fn context(&self, id: Option<&ContextId>) -> Result<&TypeContext> {
        match id {
            None => Ok(&self.default),
            Some(id) => self.contexts.get(id).ok_or_else(|| {
                PeerlinkError::TransferFailure(format!("Type-loading context not found: {}", id))
            }),
        }
    }

    /// Checks that `ty` names a type visible in its context.
    pub fn resolve_type(&self, ty: &TypeDescriptor) -> Result<()> {
        let context = self.context(ty.context())?;
        if context.knows(ty.name()) {
            Ok(())
        } else {
            Err(PeerlinkError::TransferFailure(format!(
                "Type not found: {}",
                ty
            )))
        }
    }

    /// Finds a constructor by descriptor.
    pub fn constructor(&self, ctor: &ConstructorDescriptor) -> Result<ConstructorFn> {
        let declaring = ctor.declaring();
        let context = self.context(declaring.context())?;
        let key = signature_key(declaring.name(), ctor.params());
        context
            .constructors
            .get(&key)
            .cloned()
            .ok_or_else(|| PeerlinkError::TransferFailure(format!("Constructor not found: {}", ctor)))
    }

    /// Finds a constructor by type name and parameter type names.
    ///
    /// Used for types the caller cannot name with a descriptor of its own.
    pub fn constructor_by_name(
        &self,
        context: Option<&ContextId>,
        type_name: &str,
        params: &[String],
    ) -> Result<ConstructorFn> {
        let ctx = self.context(context)?;
        let key = (type_name.to_string(), params.to_vec());
        ctx.constructors.get(&key).cloned().ok_or_else(|| {
            PeerlinkError::TransferFailure(format!(
                "Constructor not found: {}({})",
                type_name,
                params.join(", ")
            ))
        })
    }

    /// Finds a static method by descriptor.
    pub fn static_method(&self, method: &MethodDescriptor) -> Result<StaticMethodFn> {
        let declaring = method.declaring();
        let context = self.context(declaring.context())?;
        let key = (
            declaring.name().to_string(),
            signature_key(method.name(), method.params()),
        );
        context.static_methods.get(&key).cloned().ok_or_else(|| {
            PeerlinkError::TransferFailure(format!("Static method not found: {}", method))
        })
    }

    pub fn external_reader(&self, ty: &TypeDescriptor) -> Result<ExternalReaderFn> {
        let context = self.context(ty.context())?;
        context
            .external_readers
            .get(ty.name())
            .cloned()
            .ok_or_else(|| {
                PeerlinkError::TransferFailure(format!("No external reader for type: {}", ty))
            })
    }

    pub fn wrapper(&self, helper: &TypeDescriptor) -> Result<Wrapper> {
        let context = self.context(helper.context())?;
        context
            .wrappers
            .get(helper.name())
            .cloned()
            .ok_or_else(|| {
                PeerlinkError::TransferFailure(format!("No wrapper registered for: {}", helper))
            })
    }

    /// Reduces an interface set to its minimal form: duplicates and any
    /// interface extended by another member of the set are removed.
    /// Order of the remaining interfaces is preserved.
    pub fn reduce_interfaces(&self, interfaces: &[TypeDescriptor]) -> Vec<TypeDescriptor> {
        let mut result: Vec<TypeDescriptor> = Vec::with_capacity(interfaces.len());
        for (i, candidate) in interfaces.iter().enumerate() {
            if result.contains(candidate) {
                continue;
            }
            let Ok(context) = self.context(candidate.context()) else {
                result.push(candidate.clone());
                continue;
            };
            let redundant = interfaces.iter().enumerate().any(|(j, other)| {
                i != j
                    && other.context() == candidate.context()
                    && other.name() != candidate.name()
                    && context.extends(other.name(), candidate.name())
            });
            if !redundant {
                result.push(candidate.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugins() -> ContextId {
        ContextId::new("plugins")
    }

    #[test]
    fn test_unknown_context_fails() {
        let registry = TypeRegistry::new();
        let ty = TypeDescriptor::with_context("acme.Thing", Some(plugins()));
        let err = registry.resolve_type(&ty).unwrap_err();
        assert!(matches!(err, PeerlinkError::TransferFailure(_)));
        assert!(err.to_string().contains("plugins"));
    }

    #[test]
    fn test_strict_context_only_resolves_declared_types() {
        let registry = TypeRegistry::new()
            .with_context(TypeContext::new("plugins").strict().declare_type("acme.Known"));

        assert!(registry
            .resolve_type(&TypeDescriptor::with_context("acme.Known", Some(plugins())))
            .is_ok());
        assert!(registry
            .resolve_type(&TypeDescriptor::with_context("acme.Hidden", Some(plugins())))
            .is_err());
        assert!(registry
            .resolve_type(&TypeDescriptor::new("anything.Goes"))
            .is_ok());
    }

    #[test]
    fn test_static_method_lookup_by_signature() {
        let registry = TypeRegistry::new().with_default(TypeContext::default().static_method(
            "acme.Math",
            "twice",
            &["int"],
            |args| Ok(Value::Int(args[0].expect_int("x")? * 2)),
        ));

        let method = MethodDescriptor::new(
            TypeDescriptor::new("acme.Math"),
            "twice",
            [TypeDescriptor::new("int")],
        );
        let f = registry.static_method(&method).unwrap();
        assert_eq!(f(vec![Value::Int(21)]).unwrap(), Value::Int(42));

        let other = MethodDescriptor::new(
            TypeDescriptor::new("acme.Math"),
            "twice",
            [TypeDescriptor::new("long")],
        );
        assert!(registry.static_method(&other).is_err());
    }

    #[test]
    fn test_reduce_interfaces_drops_supers_and_duplicates() {
        let registry = TypeRegistry::new().with_default(
            TypeContext::default()
                .super_interfaces("acme.List", &["acme.Collection"])
                .super_interfaces("acme.Collection", &["acme.Iterable"]),
        );

        let list = TypeDescriptor::new("acme.List");
        let iterable = TypeDescriptor::new("acme.Iterable");
        let closeable = TypeDescriptor::new("acme.Closeable");

        let reduced = registry.reduce_interfaces(&[
            iterable.clone(),
            list.clone(),
            closeable.clone(),
            list.clone(),
        ]);
        assert_eq!(reduced, vec![list, closeable]);
    }
}
