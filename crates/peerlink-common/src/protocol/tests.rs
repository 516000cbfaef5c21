//! Tests for the protocol vocabulary
//!
//! These tests verify descriptor identity and the wire form of remote failures.

#[cfg(test)]
mod tests {
    use crate::protocol::{
        ContextId, FailureKind, MethodDescriptor, PeerlinkError, RemoteFailure, TypeDescriptor,
    };

    #[test]
    fn test_type_descriptor_identity_includes_context() {
        let plain = TypeDescriptor::new("demo.Echo");
        let scoped = TypeDescriptor::with_context("demo.Echo", Some(ContextId::new("plugin")));
        assert_ne!(plain, scoped);
        assert_eq!(plain, TypeDescriptor::new("demo.Echo"));
        assert_eq!(scoped.to_string(), "demo.Echo@plugin");
    }

    #[test]
    fn test_method_descriptor_display() {
        let method = MethodDescriptor::new(
            TypeDescriptor::new("demo.Echo"),
            "echo",
            [TypeDescriptor::new("string"), TypeDescriptor::new("int")],
        );
        assert_eq!(method.to_string(), "demo.Echo.echo(string, int)");
        assert_eq!(method.params().len(), 2);
    }

    #[test]
    fn test_same_signature_ignores_declaring_type() {
        let a = MethodDescriptor::new(TypeDescriptor::new("a.A"), "run", []);
        let b = MethodDescriptor::new(TypeDescriptor::new("b.B"), "run", []);
        assert!(a.same_signature(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_failure_encode_decode() {
        let failure = RemoteFailure::application("demo.Failure", "boom")
            .with_cause(RemoteFailure::application("demo.Cause", "root"));
        let encoded = failure.encode().unwrap();
        let decoded = RemoteFailure::decode(&encoded).unwrap();
        assert_eq!(decoded, failure);
    }

    #[test]
    fn test_application_failure_passes_through() {
        let failure = RemoteFailure::application("demo.Failure", "boom");
        let err = PeerlinkError::Application(failure.clone());
        assert_eq!(RemoteFailure::from_error(&err), failure);
        match failure.into_error() {
            PeerlinkError::Application(f) => assert_eq!(f.message, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transfer_failure_keeps_kind() {
        let wire = RemoteFailure::from_error(&PeerlinkError::TransferFailure("no type".into()));
        assert_eq!(wire.kind, FailureKind::Transfer);
        assert!(matches!(wire.into_error(), PeerlinkError::TransferFailure(m) if m == "no type"));
    }

    #[test]
    fn test_other_errors_become_call_failures() {
        let wire = RemoteFailure::from_error(&PeerlinkError::Protocol("bad".into()));
        assert_eq!(wire.kind, FailureKind::Invocation);
        assert!(matches!(wire.into_error(), PeerlinkError::CallFailed(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(PeerlinkError::Transport("reset".into()).is_transport());
        assert!(PeerlinkError::BlockMissing { current: 3, expected: 2 }.is_stream_fatal());
        assert!(!PeerlinkError::TransferFailure("x".into()).is_stream_fatal());
        assert!(PeerlinkError::Forbidden("m".into()).is_forbidden());
        let rethrown = PeerlinkError::Rethrown {
            wrapper: "demo.Wrapped".into(),
            source: Box::new(PeerlinkError::Forbidden("m".into())),
        };
        assert!(rethrown.is_forbidden());
        assert!(!PeerlinkError::Application(RemoteFailure::application("a", "b")).is_rmi_failure());
    }

    #[test]
    fn test_map_io_error() {
        use std::io::{Error, ErrorKind};
        assert!(matches!(
            PeerlinkError::map_io_error(Error::from(ErrorKind::TimedOut), "reading"),
            PeerlinkError::Timeout(_)
        ));
        assert!(matches!(
            PeerlinkError::map_io_error(Error::from(ErrorKind::ConnectionReset), "reading"),
            PeerlinkError::Transport(_)
        ));
        assert!(matches!(
            PeerlinkError::map_io_error(Error::from(ErrorKind::PermissionDenied), "reading"),
            PeerlinkError::Io(_)
        ));
    }
}
