//! Connection tests over loopback sockets.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use peerlink_common::{
    Command, ConstructorDescriptor, MethodDescriptor, PeerlinkError, RemoteFailure, Result,
    TypeDescriptor,
};
use peerlink_metrics::StatisticsCollector;
use uuid::Uuid;

use crate::codec::encode_command;
use crate::{
    interrupt, is_remote_object, Connection, ConnectionOptions, MethodProperties, ObjectRef,
    RemoteObject, StreamConnector, StreamPair, TransferProperties, TypeContext, TypeRegistry,
    Value, Wrapper, WriterKind,
};

// ---- harness ----

struct Pair {
    client: Arc<Connection>,
    server: Arc<Connection>,
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.client.close();
        self.server.close();
    }
}

struct LoopbackConnector {
    addr: SocketAddr,
}

impl StreamConnector for LoopbackConnector {
    fn connect(&self, _connection_id: Uuid) -> Result<StreamPair> {
        StreamPair::from_tcp(TcpStream::connect(self.addr)?)
    }
}

fn options() -> ConnectionOptions {
    ConnectionOptions::default()
        .with_worker_threads(8)
        .with_gc_sweep_interval(Duration::from_secs(60))
}

/// Connects two connections over loopback. Additional streams the client
/// opens are accepted into the server connection.
fn connect_pair(client_options: ConnectionOptions, server_options: ConnectionOptions) -> Pair {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_socket = TcpStream::connect(addr).unwrap();
    let (server_socket, _) = listener.accept().unwrap();

    let id = Uuid::new_v4();
    let server = Connection::new(
        server_options,
        id,
        1,
        StreamPair::from_tcp(server_socket).unwrap(),
        None,
    )
    .unwrap();

    let weak = Arc::downgrade(&server);
    thread::spawn(move || {
        for socket in listener.incoming() {
            let Ok(socket) = socket else { break };
            let Some(server) = weak.upgrade() else { break };
            if server.add_stream(StreamPair::from_tcp(socket).unwrap()).is_err() {
                break;
            }
        }
    });

    let client = Connection::new(
        client_options,
        id,
        1,
        StreamPair::from_tcp(client_socket).unwrap(),
        Some(Arc::new(LoopbackConnector { addr })),
    )
    .unwrap();
    Pair { client, server }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn echo_type() -> TypeDescriptor {
    TypeDescriptor::new("test.Echo")
}

fn echo_method(name: &str, params: &[&str]) -> MethodDescriptor {
    MethodDescriptor::new(echo_type(), name, params.iter().map(|p| TypeDescriptor::new(*p)))
}

#[derive(Default)]
struct Echo {
    calls: AtomicUsize,
}

impl RemoteObject for Echo {
    fn type_descriptor(&self) -> TypeDescriptor {
        echo_type()
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![echo_type()]
    }

    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match method.name() {
            "answer" => Ok(Value::Int(42)),
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            "fail" => Err(PeerlinkError::Application(RemoteFailure::application(
                "test.Boom",
                "boom",
            ))),
            "call_back" => {
                let callback = args[0].expect_object("callback")?;
                let answer = callback.invoke(&echo_method("answer", &[]), Vec::new())?;
                Ok(Value::Int(answer.expect_int("answer")? + 1))
            }
            "wait_interrupt" => {
                let start = Instant::now();
                while start.elapsed() < Duration::from_secs(5) {
                    if interrupt::is_interrupted() {
                        return Ok(Value::Bool(true));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(Value::Bool(false))
            }
            other => Err(PeerlinkError::CallFailed(format!("No such method: {}", other))),
        }
    }
}

/// Answers on the caller's side and records the thread it ran on.
#[derive(Default)]
struct Callback {
    thread: Mutex<Option<ThreadId>>,
}

impl RemoteObject for Callback {
    fn type_descriptor(&self) -> TypeDescriptor {
        echo_type()
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![echo_type()]
    }

    fn invoke(&self, _method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
        *self.thread.lock() = Some(thread::current().id());
        Ok(Value::Int(42))
    }
}

/// Blocks `wait` calls until opened.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }
}

impl RemoteObject for Gate {
    fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::new("test.Gate")
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![self.type_descriptor()]
    }

    fn invoke(&self, _method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
        Ok(Value::Null)
    }
}

/// A plain object only ever sent through a wrapper.
struct Point;

impl RemoteObject for Point {
    fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::new("test.Point")
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        Vec::new()
    }

    fn invoke(&self, method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
        Err(PeerlinkError::CallFailed(format!("No such method: {}", method.name())))
    }
}

fn point_wrapper() -> TypeDescriptor {
    TypeDescriptor::new("test.PointWrapper")
}

fn wrapper_registry() -> TypeRegistry {
    TypeRegistry::new().with_default(TypeContext::default().wrapper(
        point_wrapper().name(),
        Wrapper::new(|_| Ok(Value::Int(7)), Ok),
    ))
}

/// Publishes an [`Echo`] on the server and returns the client's proxy.
fn remote_echo(pair: &Pair) -> (Arc<Echo>, Arc<crate::Scope>, ObjectRef) {
    let echo = Arc::new(Echo::default());
    pair.server.put_context_variable("echo", echo.clone());
    let scope = pair.client.new_scope().unwrap();
    let proxy = scope
        .remote_context_variable("echo")
        .unwrap()
        .into_object()
        .unwrap();
    (echo, scope, proxy)
}

// ---- calls ----

#[test]
fn test_call_through_context_variable() {
    let pair = connect_pair(options(), options());
    let (echo, _scope, proxy) = remote_echo(&pair);

    assert!(is_remote_object(&proxy));
    let answer = proxy.invoke(&echo_method("answer", &[]), Vec::new()).unwrap();
    assert_eq!(answer.as_int(), Some(42));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    assert_eq!(pair.client.pending_request_count(), 0);

    let echoed = proxy
        .invoke(&echo_method("echo", &["string"]), vec![Value::String("hi".to_string())])
        .unwrap();
    assert_eq!(echoed.as_str(), Some("hi"));
}

#[test]
fn test_application_failure_reaches_caller_unchanged() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);

    match proxy.invoke(&echo_method("fail", &[]), Vec::new()) {
        Err(PeerlinkError::Application(failure)) => {
            assert_eq!(failure.type_name, "test.Boom");
            assert_eq!(failure.message, "boom");
        }
        other => panic!("unexpected result: {:?}", other.map(|v| v.kind_name())),
    }
}

#[test]
fn test_missing_context_variable() {
    let pair = connect_pair(options(), options());
    let scope = pair.client.new_scope().unwrap();

    assert!(scope.remote_context_variable("missing").unwrap().is_null());
    let err = scope
        .invoke_context_variable_method("missing", &echo_method("answer", &[]), Vec::new())
        .unwrap_err();
    assert!(err.to_string().contains("Context variable not found: missing"));
}

#[test]
fn test_context_variable_call_without_proxy() {
    let pair = connect_pair(options(), options());
    let echo = Arc::new(Echo::default());
    pair.server.put_context_variable("echo", echo.clone());
    let scope = pair.client.new_scope().unwrap();

    let answer = scope
        .invoke_context_variable_method("echo", &echo_method("answer", &[]), Vec::new())
        .unwrap();
    assert_eq!(answer.as_int(), Some(42));
    assert_eq!(scope.proxy_count(), 0);
}

#[test]
fn test_values_survive_round_trip() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);
    let color = TypeDescriptor::new("test.Color");
    let values = vec![
        Value::Null,
        Value::Bool(true),
        Value::Byte(-7),
        Value::Short(1234),
        Value::Int(i32::MIN),
        Value::Long(i64::MAX),
        Value::Char('λ'),
        Value::Float(1.5),
        Value::Double(-0.25),
        Value::String("héllo".to_string()),
        Value::IntArray(vec![1, 2, 3]),
        Value::CharArray(vec!['a', 'b']),
        Value::Array {
            component: color.clone(),
            elements: vec![
                Value::Enum {
                    ty: color.clone(),
                    constant: "RED".to_string(),
                },
                Value::Enum {
                    ty: color,
                    constant: "BLUE".to_string(),
                },
            ],
        },
        Value::Method(echo_method("echo", &["string"])),
    ];

    let echo = echo_method("echo", &["object"]);
    for value in values {
        let returned = proxy.invoke(&echo, vec![value.clone()]).unwrap();
        assert_eq!(returned, value);
    }
}

#[test]
fn test_new_remote_reference_round_trip() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);
    let local: ObjectRef = Arc::new(Callback::default());

    let returned = proxy
        .invoke(&echo_method("echo", &["test.Echo"]), vec![Value::Object(local.clone())])
        .unwrap()
        .into_object()
        .unwrap();
    assert!(Arc::ptr_eq(&returned, &local));
}

#[test]
fn test_callback_runs_on_waiting_thread() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);
    let callback = Arc::new(Callback::default());

    let result = proxy
        .invoke(
            &echo_method("call_back", &["test.Echo"]),
            vec![Value::Object(callback.clone())],
        )
        .unwrap();

    assert_eq!(result.as_int(), Some(43));
    assert_eq!(*callback.thread.lock(), Some(thread::current().id()));
}

#[test]
fn test_interrupt_is_forwarded_and_restored() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);

    let (handle_tx, handle_rx) = mpsc::channel();
    let caller = thread::spawn(move || {
        handle_tx.send(interrupt::current()).unwrap();
        let result = proxy.invoke(&echo_method("wait_interrupt", &[]), Vec::new());
        (result.map(|v| v.as_bool()), interrupt::is_interrupted())
    });

    let handle = handle_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    handle.interrupt();

    let (result, interrupted) = caller.join().unwrap();
    assert_eq!(result.unwrap(), Some(true));
    assert!(interrupted);
}

#[test]
fn test_ping() {
    let pair = connect_pair(options(), options());
    let rtt = pair.client.ping().unwrap();
    assert!(rtt < Duration::from_secs(5));
    assert!(pair.server.ping().is_ok());
}

// ---- construction and direct requests ----

fn server_registry() -> TypeRegistry {
    TypeRegistry::new().with_default(
        TypeContext::default()
            .constructor("test.Echo", &[], |_| Ok(Arc::new(Echo::default()) as ObjectRef))
            .static_method("test.Math", "twice", &["int"], |args| {
                Ok(Value::Int(args[0].expect_int("value")? * 2))
            }),
    )
}

fn twice() -> MethodDescriptor {
    MethodDescriptor::new(TypeDescriptor::new("test.Math"), "twice", [TypeDescriptor::new("int")])
}

#[test]
fn test_remote_construction() {
    let pair = connect_pair(options(), options().with_registry(server_registry()));
    let scope = pair.client.new_scope().unwrap();

    let by_descriptor = scope
        .new_remote_instance(&ConstructorDescriptor::new(echo_type(), []), Vec::new())
        .unwrap();
    let answer = by_descriptor.invoke(&echo_method("answer", &[]), Vec::new()).unwrap();
    assert_eq!(answer.as_int(), Some(42));

    let by_name = scope
        .new_remote_instance_by_name(None, "test.Echo", &[], Vec::new())
        .unwrap();
    let proxy = by_name.as_proxy().unwrap();
    assert_eq!(proxy.remote_interfaces(), &[echo_type()]);
}

#[test]
fn test_static_call() {
    let pair = connect_pair(options(), options().with_registry(server_registry()));
    let scope = pair.client.new_scope().unwrap();

    let result = scope.invoke_remote_static(&twice(), vec![Value::Int(21)]).unwrap();
    assert_eq!(result.as_int(), Some(42));
}

#[test]
fn test_direct_requests_forbidden() {
    let server_options = options()
        .with_registry(server_registry())
        .with_allow_direct_requests(false);
    let pair = connect_pair(options(), server_options);
    let scope = pair.client.new_scope().unwrap();

    let err = scope.invoke_remote_static(&twice(), vec![Value::Int(1)]).unwrap_err();
    assert!(err.is_forbidden(), "unexpected error: {}", err);

    let err = scope
        .new_remote_instance(&ConstructorDescriptor::new(echo_type(), []), Vec::new())
        .err().expect("expected an error");
    assert!(err.is_forbidden(), "unexpected error: {}", err);

    // Context variables stay reachable.
    pair.server.put_context_variable("echo", Arc::new(Echo::default()));
    let answer = scope
        .invoke_context_variable_method("echo", &echo_method("answer", &[]), Vec::new())
        .unwrap();
    assert_eq!(answer.as_int(), Some(42));
}

// ---- transfer properties ----

#[test]
fn test_forbidden_method_sends_nothing() {
    let answer = echo_method("answer", &[]);
    let client_options = options().with_transfer_properties(
        TransferProperties::new().with_method(answer.clone(), MethodProperties::new().forbidden()),
    );
    let pair = connect_pair(client_options, options());
    let (echo, _scope, proxy) = remote_echo(&pair);

    let before = pair.client.bytes_written();
    let err = proxy.invoke(&answer, Vec::new()).unwrap_err();
    assert!(matches!(err, PeerlinkError::Forbidden(_)));
    assert_eq!(pair.client.bytes_written(), before);
    assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cached_result_fetched_once() {
    let answer = echo_method("answer", &[]);
    let client_options = options().with_transfer_properties(
        TransferProperties::new().with_method(answer.clone(), MethodProperties::new().cache_result()),
    );
    let pair = connect_pair(client_options, options());
    let (echo, _scope, proxy) = remote_echo(&pair);

    for _ in 0..3 {
        assert_eq!(proxy.invoke(&answer, Vec::new()).unwrap().as_int(), Some(42));
    }
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fallback_and_rethrow_on_call_failure() {
    let missing = echo_method("missing", &[]);
    let vanished = echo_method("vanished", &[]);
    let client_options = options().with_transfer_properties(
        TransferProperties::new()
            .with_method(
                missing.clone(),
                MethodProperties::new().default_on_failure(|_, _| Ok(Value::Int(7))),
            )
            .with_method(vanished.clone(), MethodProperties::new().rethrow_as("test.Wrapped")),
    );
    let pair = connect_pair(client_options, options());
    let (_echo, _scope, proxy) = remote_echo(&pair);

    assert_eq!(proxy.invoke(&missing, Vec::new()).unwrap().as_int(), Some(7));
    match proxy.invoke(&vanished, Vec::new()) {
        Err(PeerlinkError::Rethrown { wrapper, source }) => {
            assert_eq!(wrapper, "test.Wrapped");
            assert!(source.to_string().contains("No such method: vanished"));
        }
        other => panic!("unexpected result: {:?}", other.map(|v| v.kind_name())),
    }
}

#[test]
fn test_statistics_recorded() {
    let pair = connect_pair(options().with_collect_statistics(true), options());
    let (_echo, _scope, proxy) = remote_echo(&pair);

    proxy.invoke(&echo_method("answer", &[]), Vec::new()).unwrap();
    let _ = proxy.invoke(&echo_method("fail", &[]), Vec::new());

    let snapshot = pair.client.statistics().unwrap().snapshot();
    assert_eq!(snapshot.total_calls, 2);
    assert_eq!(snapshot.successful_calls, 1);
    assert_eq!(snapshot.failed_calls, 1);
    assert!(pair.server.statistics().is_none());
}

// ---- transfer failures ----

#[test]
fn test_unresolvable_argument_leaves_stream_usable() {
    let server_options = options().with_registry(
        TypeRegistry::new().with_default(TypeContext::default().strict().declare_type("test.Echo")),
    );
    let pair = connect_pair(options().with_max_stream_count(1), server_options);
    let (echo, scope, proxy) = remote_echo(&pair);
    let echo_object = echo_method("echo", &["object"]);

    let err = proxy
        .invoke(&echo_object, vec![Value::Type(TypeDescriptor::new("test.Missing"))])
        .unwrap_err();
    assert!(matches!(err, PeerlinkError::TransferFailure(_)), "{}", err);
    assert!(err.to_string().contains("test.Missing"));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

    let echoed = proxy.invoke(&echo_object, vec![Value::Int(5)]).unwrap();
    assert_eq!(echoed.as_int(), Some(5));
    assert!(!scope.is_closed());
    assert_eq!(pair.client.stream_count(), 1);
}

#[test]
fn test_wrapper_without_reader_leaves_stream_usable() {
    let echo_point = echo_method("echo", &["test.Point"]);
    let client_options = options()
        .with_max_stream_count(1)
        .with_registry(wrapper_registry())
        .with_transfer_properties(TransferProperties::new().with_method(
            echo_point.clone(),
            MethodProperties::new().param_writer(0, WriterKind::Wrapper(point_wrapper())),
        ));
    let pair = connect_pair(client_options, options());
    let (echo, scope, proxy) = remote_echo(&pair);

    let err = proxy
        .invoke(&echo_point, vec![Value::Object(Arc::new(Point))])
        .unwrap_err();
    assert!(matches!(err, PeerlinkError::TransferFailure(_)), "{}", err);
    assert!(err.to_string().contains("No wrapper registered"));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

    let answer = proxy.invoke(&echo_method("answer", &[]), Vec::new()).unwrap();
    assert_eq!(answer.as_int(), Some(42));
    assert!(!scope.is_closed());
    assert_eq!(pair.client.stream_count(), 1);
}

/// Reports an interface the receiving side does not know.
struct Hidden;

impl RemoteObject for Hidden {
    fn type_descriptor(&self) -> TypeDescriptor {
        echo_type()
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![echo_type(), TypeDescriptor::new("test.Hidden")]
    }

    fn invoke(&self, _method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::Int(42))
    }
}

#[test]
fn test_unresolvable_interfaces_left_out_of_proxy() {
    let client_options = options().with_collect_statistics(true).with_registry(
        TypeRegistry::new().with_default(TypeContext::default().strict().declare_type("test.Echo")),
    );
    let pair = connect_pair(client_options, options());
    pair.server.put_context_variable("hidden", Arc::new(Hidden));
    let scope = pair.client.new_scope().unwrap();

    let proxy = scope
        .remote_context_variable("hidden")
        .unwrap()
        .into_object()
        .unwrap();
    assert_eq!(proxy.as_proxy().unwrap().remote_interfaces(), &[echo_type()]);
    let answer = proxy.invoke(&echo_method("answer", &[]), Vec::new()).unwrap();
    assert_eq!(answer.as_int(), Some(42));

    let snapshot = pair.client.statistics().unwrap().snapshot();
    assert_eq!(snapshot.inaccessible_interfaces.get("test.Hidden"), Some(&1));
}

#[test]
fn test_oversized_interface_set_is_rejected() {
    let pair = connect_pair(options(), options());
    let scope = pair.client.new_scope().unwrap();
    let obj: ObjectRef = Arc::new(Echo::default());
    let interfaces: Vec<TypeDescriptor> = (0..=usize::from(u16::MAX))
        .map(|i| TypeDescriptor::new(format!("test.I{}", i)))
        .collect();

    let err = encode_command(&scope, Command::MethodResult, |w| {
        w.expose(&obj)?;
        w.write_interfaces(&interfaces)
    })
    .unwrap_err();
    assert!(matches!(err, PeerlinkError::TransferFailure(_)));

    // The exposure made for the failed block was rolled back.
    let id = scope.expose_local_object(&obj).unwrap();
    assert_eq!(scope.local_reference_count(id), Some(1));
}

/// Calls back into the proxy it was handed, from inside a callback.
#[derive(Default)]
struct Reentrant {
    target: Mutex<Option<ObjectRef>>,
}

impl RemoteObject for Reentrant {
    fn type_descriptor(&self) -> TypeDescriptor {
        echo_type()
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![echo_type()]
    }

    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        let target = self.target.lock().clone();
        match target {
            Some(target) => target.invoke(method, args),
            None => Err(PeerlinkError::CallFailed("No target".to_string())),
        }
    }
}

#[test]
fn test_cached_method_reentered_from_callback() {
    let answer = echo_method("answer", &[]);
    let call_back = echo_method("call_back", &["test.Echo"]);
    let client_options = options().with_transfer_properties(
        TransferProperties::new()
            .with_method(answer.clone(), MethodProperties::new().cache_result())
            .with_method(call_back.clone(), MethodProperties::new().cache_result()),
    );
    let pair = connect_pair(client_options, options());
    let (echo, _scope, proxy) = remote_echo(&pair);
    let reentrant = Arc::new(Reentrant::default());
    *reentrant.target.lock() = Some(proxy.clone());

    let (tx, rx) = mpsc::channel();
    let caller = {
        let proxy = proxy.clone();
        let callback: ObjectRef = reentrant.clone();
        thread::spawn(move || {
            let _ = tx.send(proxy.invoke(&call_back, vec![Value::Object(callback)]));
        })
    };
    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("cached call deadlocked")
        .unwrap();
    caller.join().unwrap();
    assert_eq!(result.as_int(), Some(43));

    // `answer` ran once remotely and is now cached as well.
    assert_eq!(proxy.invoke(&answer, Vec::new()).unwrap().as_int(), Some(42));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
    *reentrant.target.lock() = None;
}

// ---- reference tracking ----

#[test]
fn test_exposing_twice_counts_references() {
    let pair = connect_pair(options(), options());
    let scope = pair.client.new_scope().unwrap();
    let obj: ObjectRef = Arc::new(Echo::default());

    let first = scope.expose_local_object(&obj).unwrap();
    let second = scope.expose_local_object(&obj).unwrap();
    assert_eq!(first, second);
    assert_eq!(scope.local_reference_count(first), Some(2));

    scope.references_released(first, 2).unwrap();
    assert_eq!(scope.local_reference_count(first), Some(0));
    assert_eq!(scope.sweep_unreachable(), 0);

    drop(obj);
    assert_eq!(scope.sweep_unreachable(), 1);
    assert_eq!(scope.local_object_count(), 0);
}

#[test]
fn test_periodic_sweep_removes_unreachable_objects() {
    let client_options = options().with_gc_sweep_interval(Duration::from_millis(20));
    let pair = connect_pair(client_options, options());
    let (_echo, scope, proxy) = remote_echo(&pair);
    let local: ObjectRef = Arc::new(Callback::default());

    let returned = proxy
        .invoke(&echo_method("echo", &["test.Echo"]), vec![Value::Object(local.clone())])
        .unwrap();
    assert_eq!(scope.local_object_count(), 1);

    drop(returned);
    drop(local);
    assert!(wait_until(Duration::from_secs(5), || scope.local_object_count() == 0));
}

/// Answers with a remote reference followed by a wrapped value.
struct Mixed {
    held: ObjectRef,
}

impl RemoteObject for Mixed {
    fn type_descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::new("test.Mixed")
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![self.type_descriptor()]
    }

    fn invoke(&self, _method: &MethodDescriptor, _args: Vec<Value>) -> Result<Value> {
        Ok(Value::Array {
            component: TypeDescriptor::new("object"),
            elements: vec![Value::Object(self.held.clone()), Value::Object(Arc::new(Point))],
        })
    }
}

#[test]
fn test_partially_read_answer_releases_references() {
    let server_options = options().with_registry(wrapper_registry()).with_transfer_properties(
        TransferProperties::new()
            .with_type(TypeDescriptor::new("test.Point"), WriterKind::Wrapper(point_wrapper())),
    );
    let pair = connect_pair(options(), server_options);
    let held: ObjectRef = Arc::new(Callback::default());
    pair.server.put_context_variable("mixed", Arc::new(Mixed { held: held.clone() }));
    let scope = pair.client.new_scope().unwrap();
    let server_scope = pair.server.scope(scope.remote_id()).unwrap();

    let get = MethodDescriptor::new(TypeDescriptor::new("test.Mixed"), "get", []);
    let err = scope
        .invoke_context_variable_method("mixed", &get, Vec::new())
        .unwrap_err();
    assert!(matches!(err, PeerlinkError::TransferFailure(_)), "{}", err);

    // The proxy built before the failure is dropped and its reference
    // handed back, leaving only the one added here.
    let id = server_scope.expose_local_object(&held).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server_scope.local_reference_count(id) == Some(1)
    }));
    assert_eq!(scope.proxy_count(), 0);
}

#[test]
fn test_releasing_more_than_held_is_rejected() {
    let pair = connect_pair(options(), options());
    let scope = pair.client.new_scope().unwrap();
    let obj: ObjectRef = Arc::new(Echo::default());
    let id = scope.expose_local_object(&obj).unwrap();

    assert!(scope.references_released(id, 2).is_err());
    assert_eq!(scope.local_reference_count(id), Some(1));
    assert!(scope.references_released(id + 100, 1).is_err());
}

#[test]
fn test_dropped_proxy_releases_remote_reference() {
    let pair = connect_pair(options(), options());
    let (_echo, scope, proxy) = remote_echo(&pair);
    let server_scope = pair.server.scope(scope.remote_id()).unwrap();
    let id = proxy.as_proxy().unwrap().remote_id();
    assert_eq!(server_scope.local_reference_count(id), Some(1));

    drop(proxy);
    assert!(wait_until(Duration::from_secs(5), || {
        server_scope.local_reference_count(id) == Some(0)
    }));
    assert_eq!(scope.proxy_count(), 0);
}

#[test]
fn test_same_object_gets_one_proxy() {
    let pair = connect_pair(options(), options());
    let (_echo, scope, proxy) = remote_echo(&pair);
    let again = scope
        .remote_context_variable("echo")
        .unwrap()
        .into_object()
        .unwrap();

    assert!(Arc::ptr_eq(&proxy, &again));
    assert_eq!(scope.proxy_count(), 1);
}

#[test]
fn test_proxy_passed_back_resolves_to_original() {
    let pair = connect_pair(options(), options());
    let (echo, _scope, proxy) = remote_echo(&pair);

    let returned = proxy
        .invoke(&echo_method("echo", &["test.Echo"]), vec![Value::Object(proxy.clone())])
        .unwrap()
        .into_object()
        .unwrap();
    assert!(Arc::ptr_eq(&returned, &proxy));
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
}

// ---- scopes and streams ----

#[test]
fn test_stream_count_is_bounded() {
    let pair = connect_pair(options().with_max_stream_count(2), options());
    let scopes: Vec<_> = (0..3).map(|_| pair.client.new_scope().unwrap()).collect();

    assert_eq!(pair.client.stream_count(), 2);
    let mut counts = pair.client.stream_scope_counts();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2]);
    assert!(wait_until(Duration::from_secs(5), || pair.server.scope_count() == 3));

    for scope in &scopes {
        scope.close();
    }
    assert_eq!(pair.client.scope_count(), 0);
}

#[test]
fn test_stream_count_bounded_under_concurrent_scopes() {
    let pair = connect_pair(options().with_max_stream_count(2), options());
    let barrier = Arc::new(Barrier::new(6));
    let openers: Vec<_> = (0..6)
        .map(|_| {
            let client = pair.client.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                client.new_scope().unwrap()
            })
        })
        .collect();
    let scopes: Vec<_> = openers.into_iter().map(|o| o.join().unwrap()).collect();

    assert!(pair.client.stream_count() <= 2);
    assert_eq!(pair.client.stream_scope_counts().iter().sum::<usize>(), 6);
    assert!(wait_until(Duration::from_secs(5), || pair.server.scope_count() == 6));
    assert!(pair.server.stream_count() <= 2);

    for scope in &scopes {
        scope.close();
    }
    assert_eq!(pair.client.scope_count(), 0);
}

#[test]
fn test_named_scope_shared_until_last_close() {
    let pair = connect_pair(options(), options());
    let first = pair.client.named_scope("shared").unwrap();
    let second = pair.client.named_scope("shared").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pair.server.scope_count(), 1);

    first.close();
    assert!(!second.is_closed());
    second.close();
    assert!(second.is_closed());
    assert!(wait_until(Duration::from_secs(5), || pair.server.scope_count() == 0));

    let reopened = pair.client.named_scope("shared").unwrap();
    assert!(!Arc::ptr_eq(&reopened, &first));
}

#[test]
fn test_named_scope_requested_concurrently() {
    let pair = connect_pair(options(), options());
    let callers: Vec<_> = (0..2)
        .map(|_| {
            let client = pair.client.clone();
            thread::spawn(move || client.named_scope("x").unwrap())
        })
        .collect();
    let scopes: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();

    assert!(Arc::ptr_eq(&scopes[0], &scopes[1]));
    assert_eq!(pair.server.scope_count(), 1);
    scopes[0].close();
    assert!(!scopes[1].is_closed());
    scopes[1].close();
    assert!(wait_until(Duration::from_secs(5), || pair.server.scope_count() == 0));
}

#[test]
fn test_named_scope_reacquired_while_closing() {
    let pair = connect_pair(options().with_max_stream_count(1), options());
    pair.server.put_context_variable("echo", Arc::new(Echo::default()));
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let client = pair.client.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let scope = client.named_scope("churn").unwrap();
                    let answer = scope
                        .invoke_context_variable_method("echo", &echo_method("answer", &[]), Vec::new())
                        .unwrap();
                    assert_eq!(answer.as_int(), Some(42));
                    scope.close();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pair.client.scope_count(), 0);
    assert!(wait_until(Duration::from_secs(5), || pair.server.scope_count() == 0));
}

#[test]
fn test_async_call_defers_scope_close() {
    let pair = connect_pair(options(), options());
    let gate = Arc::new(Gate::default());
    pair.server.put_context_variable("gate", gate.clone());
    let scope = pair.client.new_scope().unwrap();
    let proxy = scope
        .remote_context_variable("gate")
        .unwrap()
        .into_object()
        .unwrap();

    let wait = MethodDescriptor::new(TypeDescriptor::new("test.Gate"), "wait", []);
    proxy.as_proxy().unwrap().call_async(&wait, Vec::new()).unwrap();
    scope.close();
    assert!(scope.is_aborting());
    assert!(!scope.is_closed());

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || scope.is_closed()));
}

#[test]
fn test_call_on_closed_scope_fails() {
    let pair = connect_pair(options(), options());
    let (_echo, scope, proxy) = remote_echo(&pair);
    scope.close();

    let err = proxy.invoke(&echo_method("answer", &[]), Vec::new()).unwrap_err();
    assert!(err.to_string().contains("closed"), "unexpected error: {}", err);
}

// ---- lifecycle ----

#[test]
fn test_close_wait_closes_both_sides() {
    let pair = connect_pair(options(), options());
    let (_echo, _scope, _proxy) = remote_echo(&pair);

    let notified = Arc::new(AtomicBool::new(false));
    let flag = notified.clone();
    pair.server.add_close_listener(move || flag.store(true, Ordering::SeqCst));

    assert!(pair.client.close_wait(Some(Duration::from_secs(5))));
    assert!(pair.client.is_closed());
    assert!(wait_until(Duration::from_secs(5), || pair.server.is_closed()));
    assert!(notified.load(Ordering::SeqCst));

    assert!(pair.client.new_scope().is_err());
    assert!(pair.client.ping().is_err());
}

#[test]
fn test_close_listener_fires_when_already_closed() {
    let pair = connect_pair(options(), options());
    pair.client.close();

    let notified = Arc::new(AtomicBool::new(false));
    let flag = notified.clone();
    pair.client.add_close_listener(move || flag.store(true, Ordering::SeqCst));
    assert!(notified.load(Ordering::SeqCst));
}

#[test]
fn test_removed_error_listener_is_not_registered() {
    let pair = connect_pair(options(), options());
    let id = pair.client.add_error_listener(|_| {});
    assert!(pair.client.remove_error_listener(id));
    assert!(!pair.client.remove_error_listener(id));
}
