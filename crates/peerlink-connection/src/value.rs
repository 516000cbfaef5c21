//! Values that can cross a connection.

use std::fmt;
use std::sync::Arc;

use peerlink_common::{
    ConstructorDescriptor, ContextId, FieldDescriptor, MethodDescriptor, PeerlinkError, Result,
    TypeDescriptor,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::object::{object_identity, ObjectRef};

/// An externally serialized value: an opaque postcard payload tagged with
/// the type it decodes to. The type's context is the type-loading context
/// the payload belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedValue {
    ty: TypeDescriptor,
    payload: Vec<u8>,
}

impl SerializedValue {
    pub fn new(ty: TypeDescriptor, payload: Vec<u8>) -> Self {
        Self { ty, payload }
    }

    /// Serializes `value` with postcard.
    pub fn encode<T: Serialize>(ty: TypeDescriptor, value: &T) -> Result<Self> {
        Ok(Self {
            ty,
            payload: postcard::to_stdvec(value)?,
        })
    }

    /// Deserializes the payload with postcard.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn context(&self) -> Option<&ContextId> {
        self.ty.context()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A value passed as a call argument or returned as a result.
///
/// Primitives, strings and primitive arrays are always sent by value.
/// [`Value::Object`] is sent according to the transfer properties of its
/// type: usually by reference, so the peer receives a proxy.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Char(char),
    Float(f32),
    Double(f64),
    String(String),
    BoolArray(Vec<bool>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    CharArray(Vec<char>),
    Array {
        component: TypeDescriptor,
        elements: Vec<Value>,
    },
    Enum {
        ty: TypeDescriptor,
        constant: String,
    },
    Object(ObjectRef),
    Serialized(SerializedValue),
    Type(TypeDescriptor),
    Method(MethodDescriptor),
    Constructor(ConstructorDescriptor),
    Field(FieldDescriptor),
    Context(Option<ContextId>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Char(_) => "char",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::BoolArray(_) => "boolean[]",
            Value::ByteArray(_) => "byte[]",
            Value::ShortArray(_) => "short[]",
            Value::IntArray(_) => "int[]",
            Value::LongArray(_) => "long[]",
            Value::FloatArray(_) => "float[]",
            Value::DoubleArray(_) => "double[]",
            Value::CharArray(_) => "char[]",
            Value::Array { .. } => "array",
            Value::Enum { .. } => "enum",
            Value::Object(_) => "object",
            Value::Serialized(_) => "serialized",
            Value::Type(_) => "type",
            Value::Method(_) => "method",
            Value::Constructor(_) => "constructor",
            Value::Field(_) => "field",
            Value::Context(_) => "context",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an `i32` if it is an integral type that fits.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Byte(v) => Some(i32::from(*v)),
            Value::Short(v) => Some(i32::from(*v)),
            Value::Int(v) => Some(*v),
            Value::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Short(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Like [`Value::as_str`] but fails with a transfer failure naming `what`.
    pub fn expect_str(&self, what: &str) -> Result<&str> {
        self.as_str().ok_or_else(|| mismatch(what, "string", self))
    }

    /// Like [`Value::as_int`] but fails with a transfer failure naming `what`.
    pub fn expect_int(&self, what: &str) -> Result<i32> {
        self.as_int().ok_or_else(|| mismatch(what, "int", self))
    }

    /// Like [`Value::as_object`] but fails with a transfer failure naming `what`.
    pub fn expect_object(&self, what: &str) -> Result<&ObjectRef> {
        self.as_object().ok_or_else(|| mismatch(what, "object", self))
    }
}

fn mismatch(what: &str, expected: &str, actual: &Value) -> PeerlinkError {
    PeerlinkError::TransferFailure(format!(
        "{} must be {}, got {}",
        what,
        expected,
        actual.kind_name()
    ))
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Byte(v) => write!(f, "Byte({v})"),
            Value::Short(v) => write!(f, "Short({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Long(v) => write!(f, "Long({v})"),
            Value::Char(v) => write!(f, "Char({v:?})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::BoolArray(v) => write!(f, "BoolArray({v:?})"),
            Value::ByteArray(v) => write!(f, "ByteArray({v:?})"),
            Value::ShortArray(v) => write!(f, "ShortArray({v:?})"),
            Value::IntArray(v) => write!(f, "IntArray({v:?})"),
            Value::LongArray(v) => write!(f, "LongArray({v:?})"),
            Value::FloatArray(v) => write!(f, "FloatArray({v:?})"),
            Value::DoubleArray(v) => write!(f, "DoubleArray({v:?})"),
            Value::CharArray(v) => write!(f, "CharArray({v:?})"),
            Value::Array {
                component,
                elements,
            } => f
                .debug_struct("Array")
                .field("component", component)
                .field("elements", elements)
                .finish(),
            Value::Enum { ty, constant } => write!(f, "Enum({ty}.{constant})"),
            Value::Object(obj) => match obj.as_proxy() {
                Some(proxy) => write!(
                    f,
                    "Object(proxy {} #{})",
                    obj.type_descriptor(),
                    proxy.remote_id()
                ),
                None => write!(f, "Object({})", obj.type_descriptor()),
            },
            Value::Serialized(v) => write!(
                f,
                "Serialized({}, {} bytes)",
                v.type_descriptor(),
                v.payload().len()
            ),
            Value::Type(v) => write!(f, "Type({v})"),
            Value::Method(v) => write!(f, "Method({v})"),
            Value::Constructor(v) => write!(f, "Constructor({v})"),
            Value::Field(v) => write!(f, "Field({v})"),
            Value::Context(Some(v)) => write!(f, "Context({v})"),
            Value::Context(None) => f.write_str("Context(default)"),
        }
    }
}

/// Objects compare by identity: two proxies are equal when they stand for
/// the same remote object in the same scope.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BoolArray(a), Value::BoolArray(b)) => a == b,
            (Value::ByteArray(a), Value::ByteArray(b)) => a == b,
            (Value::ShortArray(a), Value::ShortArray(b)) => a == b,
            (Value::IntArray(a), Value::IntArray(b)) => a == b,
            (Value::LongArray(a), Value::LongArray(b)) => a == b,
            (Value::FloatArray(a), Value::FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::CharArray(a), Value::CharArray(b)) => a == b,
            (
                Value::Array {
                    component: ca,
                    elements: ea,
                },
                Value::Array {
                    component: cb,
                    elements: eb,
                },
            ) => ca == cb && ea == eb,
            (
                Value::Enum {
                    ty: ta,
                    constant: ka,
                },
                Value::Enum {
                    ty: tb,
                    constant: kb,
                },
            ) => ta == tb && ka == kb,
            (Value::Object(a), Value::Object(b)) => match (a.as_proxy(), b.as_proxy()) {
                (Some(pa), Some(pb)) => pa.is_same_remote(pb),
                _ => object_identity(a) == object_identity(b),
            },
            (Value::Serialized(a), Value::Serialized(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::Constructor(a), Value::Constructor(b)) => a == b,
            (Value::Field(a), Value::Field(b)) => a == b,
            (Value::Context(a), Value::Context(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    char => Char,
    f32 => Float,
    f64 => Double,
    String => String,
    Vec<bool> => BoolArray,
    Vec<i8> => ByteArray,
    Vec<i16> => ShortArray,
    Vec<i32> => IntArray,
    Vec<i64> => LongArray,
    Vec<f32> => FloatArray,
    Vec<f64> => DoubleArray,
    Vec<char> => CharArray,
    ObjectRef => Object,
    SerializedValue => Serialized,
    TypeDescriptor => Type,
    MethodDescriptor => Method,
    ConstructorDescriptor => Constructor,
    FieldDescriptor => Field,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Wraps a concrete object as a [`Value::Object`].
pub fn object<T: crate::object::RemoteObject>(obj: T) -> Value {
    Value::Object(Arc::new(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_widening() {
        assert_eq!(Value::Byte(-3).as_int(), Some(-3));
        assert_eq!(Value::Short(300).as_long(), Some(300));
        assert_eq!(Value::Long(i64::MAX).as_int(), None);
        assert_eq!(Value::String("x".into()).as_int(), None);
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_expect_reports_kind() {
        let err = Value::Int(3).expect_str("name").unwrap_err();
        assert!(err.to_string().contains("name must be string, got int"));
    }

    #[test]
    fn test_serialized_round_trip() {
        let ty = TypeDescriptor::with_context("acme.Point", Some(ContextId::new("plugins")));
        let value = SerializedValue::encode(ty.clone(), &(3i32, -4i32)).unwrap();
        assert_eq!(value.context().map(ContextId::as_str), Some("plugins"));
        assert_eq!(value.decode::<(i32, i32)>().unwrap(), (3, -4));
    }

    #[test]
    fn test_option_conversion() {
        assert!(Value::from(None::<i32>).is_null());
        assert_eq!(Value::from(Some("a")), Value::String("a".into()));
    }
}
