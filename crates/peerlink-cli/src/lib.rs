//! # peerlink CLI
//!
//! Command-line interface for peerlink servers.
//!
//! This crate holds the pieces the `peerlink` binary shares with its tests:
//!
//! - **Demo object**: [`DemoEcho`], published as the `echo` context
//!   variable on every connection a `peerlink serve` accepts
//! - **Output**: [`to_json`] renders call results for `peerlink call`
//!
//! ## Key Commands
//!
//! - `peerlink serve`: Start a server exposing the demo object
//! - `peerlink ping`: Handshake ping
//! - `peerlink shutdown`: Ask a server to stop
//! - `peerlink call`: Call a context variable's method (prints raw JSON)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peerlink_common::{MethodDescriptor, PeerlinkError, Result, TypeDescriptor};
use peerlink_connection::{Connection, RemoteObject, Value};
use serde_json::json;

/// Context variable the demo object is published under.
pub const ECHO_VARIABLE: &str = "echo";

/// Interface of the demo object.
pub const ECHO_TYPE: &str = "peerlink.demo.Echo";

/// Demo object answering `echo(String)`, `reverse(String)` and `count()`.
///
/// `count` returns how many `echo` and `reverse` calls the object served.
#[derive(Debug, Default)]
pub struct DemoEcho {
    served: AtomicU64,
}

impl RemoteObject for DemoEcho {
    fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::new(ECHO_TYPE)
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![self.type_descriptor()]
    }

    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        match (method.name(), args.as_slice()) {
            ("echo", [text]) => {
                self.served.fetch_add(1, Ordering::Relaxed);
                Ok(Value::String(text.expect_str("text")?.to_string()))
            }
            ("reverse", [text]) => {
                self.served.fetch_add(1, Ordering::Relaxed);
                Ok(Value::String(text.expect_str("text")?.chars().rev().collect()))
            }
            ("count", []) => Ok(Value::Long(self.served.load(Ordering::Relaxed) as i64)),
            (name, args) => Err(PeerlinkError::CallFailed(format!(
                "No method {}.{} taking {} arguments",
                ECHO_TYPE,
                name,
                args.len()
            ))),
        }
    }
}

/// Publishes a fresh [`DemoEcho`] on `connection`.
pub fn install_demo(connection: &Arc<Connection>) -> Result<()> {
    connection.put_context_variable(ECHO_VARIABLE, Arc::new(DemoEcho::default()));
    Ok(())
}

/// Descriptor of a method on `type_name` taking `arg_count` strings.
pub fn string_method(type_name: &str, name: &str, arg_count: usize) -> MethodDescriptor {
    MethodDescriptor::new(
        TypeDescriptor::new(type_name),
        name,
        (0..arg_count).map(|_| TypeDescriptor::new("string")),
    )
}

/// Renders a call result as JSON.
///
/// Objects have no JSON form and render as a description of their type.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Byte(n) => json!(n),
        Value::Short(n) => json!(n),
        Value::Int(n) => json!(n),
        Value::Long(n) => json!(n),
        Value::Char(c) => json!(c.to_string()),
        Value::Float(n) => json!(n),
        Value::Double(n) => json!(n),
        Value::String(s) => json!(s),
        Value::BoolArray(v) => json!(v),
        Value::ByteArray(v) => json!(v),
        Value::ShortArray(v) => json!(v),
        Value::IntArray(v) => json!(v),
        Value::LongArray(v) => json!(v),
        Value::FloatArray(v) => json!(v),
        Value::DoubleArray(v) => json!(v),
        Value::CharArray(v) => json!(v.iter().collect::<String>()),
        Value::Array { elements, .. } => elements.iter().map(to_json).collect(),
        Value::Enum { constant, .. } => json!(constant),
        Value::Object(obj) => json!({ "object": obj.type_descriptor().name() }),
        Value::Serialized(s) => json!({ "serialized": s.type_descriptor().name() }),
        Value::Type(t) => json!(t.to_string()),
        Value::Method(m) => json!(m.to_string()),
        Value::Constructor(c) => json!(c.to_string()),
        Value::Field(f) => json!(f.to_string()),
        Value::Context(c) => c
            .as_ref()
            .map(|c| json!(c.as_str()))
            .unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_methods() {
        let echo = DemoEcho::default();
        let hello = || vec![Value::String("hello".to_string())];

        let out = echo.invoke(&string_method(ECHO_TYPE, "echo", 1), hello()).unwrap();
        assert_eq!(out.as_str(), Some("hello"));
        let out = echo.invoke(&string_method(ECHO_TYPE, "reverse", 1), hello()).unwrap();
        assert_eq!(out.as_str(), Some("olleh"));
        let out = echo.invoke(&string_method(ECHO_TYPE, "count", 0), Vec::new()).unwrap();
        assert_eq!(out.as_long(), Some(2));
    }

    #[test]
    fn test_demo_rejects_unknown_method() {
        let echo = DemoEcho::default();
        let err = echo
            .invoke(&string_method(ECHO_TYPE, "shout", 1), vec![Value::Null])
            .unwrap_err();
        assert!(err.to_string().contains("peerlink.demo.Echo.shout"));
    }

    #[test]
    fn test_to_json() {
        assert_eq!(to_json(&Value::Null), serde_json::Value::Null);
        assert_eq!(to_json(&Value::Int(7)), json!(7));
        assert_eq!(to_json(&Value::String("x".to_string())), json!("x"));
        assert_eq!(to_json(&Value::CharArray(vec!['a', 'b'])), json!("ab"));
        assert_eq!(to_json(&Value::IntArray(vec![1, 2])), json!([1, 2]));
        assert_eq!(
            to_json(&Value::Array {
                component: TypeDescriptor::new("string"),
                elements: vec![Value::Bool(true), Value::Long(3)],
            }),
            json!([true, 3])
        );
        assert_eq!(
            to_json(&Value::Object(Arc::new(DemoEcho::default()))),
            json!({ "object": ECHO_TYPE })
        );
    }
}
