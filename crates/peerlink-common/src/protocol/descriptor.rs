//! Reflective descriptors that can cross the wire.
//!
//! Types are nominal: a [`TypeDescriptor`] is a name qualified by the type-loading
//! context it should be resolved in. Methods, constructors and fields are identified
//! by their declaring type plus name and parameter types.

use std::fmt;
use std::sync::Arc;

/// Identifier of a type-loading context.
///
/// A context is the isolated namespace a type name is resolved against. The
/// default context is represented by `None` wherever an `Option<ContextId>` appears.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Arc<str>);

impl ContextId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        ContextId::new(s)
    }
}

/// A type, named within a type-loading context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDescriptor {
    name: Arc<str>,
    context: Option<ContextId>,
}

impl TypeDescriptor {
    /// Creates a descriptor for a type in the default context.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            context: None,
        }
    }

    /// Creates a descriptor for a type in the given context.
    pub fn with_context(name: impl AsRef<str>, context: Option<ContextId>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> Option<&ContextId> {
        self.context.as_ref()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}@{}", self.name, ctx),
            None => f.write_str(&self.name),
        }
    }
}

/// A method of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    declaring: TypeDescriptor,
    name: Arc<str>,
    params: Arc<[TypeDescriptor]>,
}

impl MethodDescriptor {
    pub fn new(
        declaring: TypeDescriptor,
        name: impl AsRef<str>,
        params: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Self {
        Self {
            declaring,
            name: Arc::from(name.as_ref()),
            params: params.into_iter().collect(),
        }
    }

    pub fn declaring(&self) -> &TypeDescriptor {
        &self.declaring
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[TypeDescriptor] {
        &self.params
    }

    /// Returns `true` if this method has the same name and parameters as `other`,
    /// regardless of the declaring type.
    pub fn same_signature(&self, other: &MethodDescriptor) -> bool {
        self.name == other.name && self.params == other.params
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}(", self.declaring, self.name)?;
        write_params(f, &self.params)?;
        f.write_str(")")
    }
}

/// A constructor of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstructorDescriptor {
    declaring: TypeDescriptor,
    params: Arc<[TypeDescriptor]>,
}

impl ConstructorDescriptor {
    pub fn new(declaring: TypeDescriptor, params: impl IntoIterator<Item = TypeDescriptor>) -> Self {
        Self {
            declaring,
            params: params.into_iter().collect(),
        }
    }

    pub fn declaring(&self) -> &TypeDescriptor {
        &self.declaring
    }

    pub fn params(&self) -> &[TypeDescriptor] {
        &self.params
    }
}

impl fmt::Display for ConstructorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.declaring)?;
        write_params(f, &self.params)?;
        f.write_str(")")
    }
}

/// A field of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    declaring: TypeDescriptor,
    name: Arc<str>,
}

impl FieldDescriptor {
    pub fn new(declaring: TypeDescriptor, name: impl AsRef<str>) -> Self {
        Self {
            declaring,
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn declaring(&self) -> &TypeDescriptor {
        &self.declaring
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring, self.name)
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[TypeDescriptor]) -> fmt::Result {
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", p)?;
    }
    Ok(())
}
