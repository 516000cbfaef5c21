// End-to-end tests: a peerlink-server on loopback, connections opened with
// peerlink-client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerlink_client::{connect, ping, shutdown, ClientOptions};
use peerlink_common::{MethodDescriptor, PeerlinkError, Result, TypeDescriptor};
use peerlink_connection::{ConnectionOptions, ObjectRef, RemoteObject, Value};
use peerlink_server::{Server, ServerOptions};

const TIMEOUT: Duration = Duration::from_secs(2);

fn counter_type() -> TypeDescriptor {
    TypeDescriptor::new("test.Counter")
}

fn method(name: &str, params: &[&str]) -> MethodDescriptor {
    MethodDescriptor::new(counter_type(), name, params.iter().map(|p| TypeDescriptor::new(*p)))
}

/// Adds to a shared total. `add_from` asks a caller-supplied counter for
/// the amount.
#[derive(Default)]
struct Counter {
    total: AtomicI32,
}

impl RemoteObject for Counter {
    fn type_descriptor(&self) -> TypeDescriptor {
        counter_type()
    }

    fn interfaces(&self) -> Vec<TypeDescriptor> {
        vec![counter_type()]
    }

    fn invoke(&self, m: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        match m.name() {
            "add" => {
                let n = args[0].expect_int("amount")?;
                Ok(Value::Int(self.total.fetch_add(n, Ordering::SeqCst) + n))
            }
            "get" => Ok(Value::Int(self.total.load(Ordering::SeqCst))),
            "add_from" => {
                let source = args[0].expect_object("source")?;
                let n = source.invoke(&method("get", &[]), Vec::new())?.expect_int("amount")?;
                Ok(Value::Int(self.total.fetch_add(n, Ordering::SeqCst) + n))
            }
            other => Err(PeerlinkError::CallFailed(format!("No such method: {}", other))),
        }
    }
}

async fn start() -> (Arc<Server>, SocketAddr) {
    let options = ServerOptions::default().with_setup(|connection| {
        connection.put_context_variable("counter", Arc::new(Counter::default()));
        Ok(())
    });
    let server = Arc::new(Server::bind("127.0.0.1:0", options).await.unwrap());
    let addr = server.local_addr();
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    (server, addr)
}

fn client_options(max_streams: usize) -> ClientOptions {
    ClientOptions::default().with_connection_options(
        ConnectionOptions::default()
            .with_max_stream_count(max_streams)
            .with_gc_sweep_interval(Duration::from_secs(60)),
    )
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_counter() {
    let (_server, addr) = start().await;

    let totals = blocking(move || -> Result<Vec<i32>> {
        let connection = connect(&addr.to_string(), client_options(1))?;
        let scope = connection.new_scope()?;
        let counter = scope
            .remote_context_variable("counter")?
            .into_object()
            .ok_or_else(|| PeerlinkError::CallFailed("counter missing".to_string()))?;
        let mut totals = Vec::new();
        for n in [1, 2, 3] {
            let total = counter.invoke(&method("add", &["int"]), vec![Value::Int(n)])?;
            totals.push(total.expect_int("total")?);
        }
        scope.close();
        connection.close_wait(Some(TIMEOUT));
        Ok(totals)
    })
    .await
    .unwrap();

    assert_eq!(totals, vec![1, 3, 6]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_callback_into_client() {
    let (_server, addr) = start().await;

    let total = blocking(move || -> Result<i32> {
        let connection = connect(&addr.to_string(), client_options(1))?;
        let scope = connection.new_scope()?;
        let local = Arc::new(Counter::default());
        local.total.store(5, Ordering::SeqCst);
        let source: ObjectRef = local;
        let total = scope.invoke_context_variable_method(
            "counter",
            &method("add_from", &["test.Counter"]),
            vec![Value::Object(source)],
        )?;
        connection.close();
        total.expect_int("total")
    })
    .await
    .unwrap();

    assert_eq!(total, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_additional_streams_dialed() {
    let (server, addr) = start().await;

    let connection = blocking(move || connect(&addr.to_string(), client_options(3)))
        .await
        .unwrap();
    let opener = connection.clone();
    let scopes = blocking(move || {
        (0..3)
            .map(|_| opener.new_scope())
            .collect::<Result<Vec<_>>>()
    })
    .await
    .unwrap();

    assert_eq!(connection.stream_count(), 3);
    let accepted = server.connections().pop().unwrap();
    assert_eq!(accepted.connection_id(), connection.connection_id());
    assert_eq!(accepted.stream_count(), 3);
    assert_eq!(accepted.scope_count(), 3);

    for scope in scopes {
        scope.close();
    }
    blocking(move || connection.close_wait(Some(TIMEOUT))).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_and_shutdown() {
    let (server, addr) = start().await;
    let target = addr.to_string();

    blocking(move || -> Result<()> {
        ping(&target, TIMEOUT)?;
        shutdown(&target, TIMEOUT)
    })
    .await
    .unwrap();

    assert!(server.is_closed());
    let target = addr.to_string();
    assert!(blocking(move || ping(&target, Duration::from_millis(200))).await.is_err());
}
