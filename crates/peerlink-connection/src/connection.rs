//! Connections: everything shared with one peer.
//!
//! A connection owns a set of streams, the scopes placed on them, the
//! request correlator, the worker pool that executes the peer's calls and
//! a collector thread that returns references of dropped proxies. Scopes
//! are spread over the streams: an idle stream is reused first, then a new
//! stream is opened while the count is below the configured maximum, then
//! the least loaded stream takes the scope.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use peerlink_common::transport::WireWriter;
use peerlink_common::{Command, PeerlinkError, Result, NO_ID};
use peerlink_metrics::ConnectionStatistics;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::object::ObjectRef;
use crate::options::ConnectionOptions;
use crate::pool::WorkerPool;
use crate::request::{serving_request, RequestHandler, Response, ServingTable};
use crate::stream::{Stream, StreamPair};
use crate::variables::Scope;

static NEXT_CONNECTION_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Opens additional streams of an established connection.
///
/// The initiating side of a connection provides one; the accepting side
/// receives additional streams from its server instead.
pub trait StreamConnector: Send + Sync {
    /// Opens one more stream for the connection `connection_id`.
    fn connect(&self, connection_id: Uuid) -> Result<StreamPair>;
}

/// Work for the connection's collector thread.
pub(crate) enum GcEvent {
    ProxyDropped {
        scope: Arc<Scope>,
        remote_id: u32,
        serial: u64,
    },
    Shutdown,
}

/// Handle returned when registering an error listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ErrorListener = Box<dyn FnOnce(&PeerlinkError) + Send>;
type CloseListener = Box<dyn FnOnce() + Send>;

struct StreamSet {
    streams: Vec<Arc<Stream>>,
    /// Streams being dialed that count against the maximum.
    reserved: usize,
}

struct Lifecycle {
    aborting: bool,
    closed: bool,
    error: Option<Arc<PeerlinkError>>,
    error_listeners: Vec<(ListenerId, ErrorListener)>,
    close_listeners: Vec<CloseListener>,
    next_listener: u64,
}

/// A connection with one peer.
pub struct Connection {
    serial: u64,
    connection_id: Uuid,
    version: u16,
    options: ConnectionOptions,
    streams: Mutex<StreamSet>,
    next_stream_serial: AtomicU64,
    connector: Option<Arc<dyn StreamConnector>>,
    requests: RequestHandler,
    serving: ServingTable,
    scopes: RwLock<HashMap<u32, Arc<Scope>>>,
    next_scope_id: AtomicU32,
    named: Mutex<HashMap<String, Arc<Mutex<Option<Arc<Scope>>>>>>,
    context_variables: RwLock<HashMap<String, ObjectRef>>,
    pool: Arc<WorkerPool>,
    gc: Mutex<Option<Sender<GcEvent>>>,
    lifecycle: Mutex<Lifecycle>,
    closed_signal: Condvar,
    statistics: Option<ConnectionStatistics>,
}

impl Connection {
    /// Creates a connection over its first stream.
    ///
    /// # Arguments
    ///
    /// * `options` - Connection configuration
    /// * `connection_id` - Id both endpoints agreed on during the handshake
    /// * `version` - Negotiated protocol version
    /// * `first` - The stream the handshake ran on
    /// * `connector` - Dials additional streams; `None` on the accepting side
    ///
    /// # Errors
    ///
    /// Fails if the worker pool or the stream reader cannot be started.
    pub fn new(
        options: ConnectionOptions,
        connection_id: Uuid,
        version: u16,
        first: StreamPair,
        connector: Option<Arc<dyn StreamConnector>>,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(WorkerPool::new(options.executor.clone(), options.worker_threads)?);
        let (gc_tx, gc_rx) = mpsc::channel();
        let statistics = options.collect_statistics.then(ConnectionStatistics::new);
        let sweep_interval = options.gc_sweep_interval;
        let serial = NEXT_CONNECTION_SERIAL.fetch_add(1, Ordering::Relaxed);

        let connection = Arc::new(Self {
            serial,
            connection_id,
            version,
            options,
            streams: Mutex::new(StreamSet {
                streams: Vec::new(),
                reserved: 0,
            }),
            next_stream_serial: AtomicU64::new(1),
            connector,
            requests: RequestHandler::new(),
            serving: ServingTable::default(),
            scopes: RwLock::new(HashMap::new()),
            next_scope_id: AtomicU32::new(1),
            named: Mutex::new(HashMap::new()),
            context_variables: RwLock::new(HashMap::new()),
            pool,
            gc: Mutex::new(Some(gc_tx)),
            lifecycle: Mutex::new(Lifecycle {
                aborting: false,
                closed: false,
                error: None,
                error_listeners: Vec::new(),
                close_listeners: Vec::new(),
                next_listener: 1,
            }),
            closed_signal: Condvar::new(),
            statistics,
        });

        let weak = Arc::downgrade(&connection);
        thread::Builder::new()
            .name(format!("peerlink-gc-{}", serial))
            .spawn(move || collect_loop(gc_rx, weak, sweep_interval))
            .map_err(|e| PeerlinkError::Transport(format!("Failed to spawn collector: {}", e)))?;

        if let Err(e) = connection.add_stream(first) {
            connection.close();
            return Err(e);
        }
        info!(
            connection = %connection_id,
            serial,
            version,
            "Connection established"
        );
        Ok(connection)
    }

    /// Process-unique serial of this connection.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn protocol_version(&self) -> u16 {
        self.version
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Call statistics, if enabled in the options.
    pub fn statistics(&self) -> Option<&ConnectionStatistics> {
        self.statistics.as_ref()
    }

    pub(crate) fn requests(&self) -> &RequestHandler {
        &self.requests
    }

    pub(crate) fn serving(&self) -> &ServingTable {
        &self.serving
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    // ---- streams ----

    /// Adds a stream the peer opened for this connection.
    pub fn add_stream(self: &Arc<Self>, pair: StreamPair) -> Result<()> {
        self.register_stream(pair, false).map(|_| ())
    }

    /// Registers a stream and starts its reader. With `claim` the stream
    /// was dialed for a new scope: its reservation is consumed and the
    /// scope counted on it.
    fn register_stream(self: &Arc<Self>, pair: StreamPair, claim: bool) -> Result<Arc<Stream>> {
        let serial = self.next_stream_serial.fetch_add(1, Ordering::Relaxed);
        let (stream, reader) = Stream::new(serial, pair);
        let stream = Arc::new(stream);
        {
            let mut set = self.streams.lock();
            if claim {
                set.reserved = set.reserved.saturating_sub(1);
            }
            if self.is_aborting() {
                drop(set);
                stream.close(false);
                return Err(PeerlinkError::Closed("Connection closed".to_string()));
            }
            if claim {
                stream.add_scope();
            }
            set.streams.push(stream.clone());
        }
        if let Err(e) = stream.spawn_reader(self.clone(), reader) {
            self.streams.lock().streams.retain(|s| !Arc::ptr_eq(s, &stream));
            stream.close(false);
            return Err(e);
        }
        debug!(
            connection = %self.connection_id,
            stream = serial,
            peer = stream.description(),
            "Stream added"
        );
        Ok(stream)
    }

    /// Picks the stream for a new scope and counts the scope on it.
    fn place_scope(self: &Arc<Self>) -> Result<Arc<Stream>> {
        let mut connector = self.connector.clone();
        loop {
            let dialer = {
                let mut set = self.streams.lock();
                if self.is_aborting() {
                    return Err(PeerlinkError::Closed("Connection closed".to_string()));
                }
                if let Some(idle) = set
                    .streams
                    .iter()
                    .find(|s| !s.is_closed() && s.scope_count() == 0)
                {
                    idle.add_scope();
                    return Ok(idle.clone());
                }
                match &connector {
                    Some(c) if set.streams.len() + set.reserved < self.options.max_stream_count => {
                        set.reserved += 1;
                        c.clone()
                    }
                    _ => {
                        let least = set
                            .streams
                            .iter()
                            .filter(|s| !s.is_closed())
                            .min_by_key(|s| s.scope_count())
                            .ok_or_else(|| {
                                PeerlinkError::Transport("No live stream available".to_string())
                            })?;
                        least.add_scope();
                        return Ok(least.clone());
                    }
                }
            };

            // Dial outside the lock.
            match dialer.connect(self.connection_id) {
                Ok(pair) => return self.register_stream(pair, true),
                Err(e) => {
                    warn!(connection = %self.connection_id, error = %e, "Failed to open additional stream");
                    self.streams.lock().reserved -= 1;
                    connector = None;
                }
            }
        }
    }

    /// Called by a stream reader when its stream has ended.
    pub(crate) fn stream_ended(self: &Arc<Self>, stream: &Arc<Stream>, outcome: Result<()>) {
        stream.close(false);
        let remaining = {
            let mut set = self.streams.lock();
            set.streams.retain(|s| !Arc::ptr_eq(s, stream));
            set.streams.len() + set.reserved
        };

        let reason = match &outcome {
            Ok(()) => format!("Stream {} closed", stream.serial()),
            Err(e) => format!("Stream {} failed: {}", stream.serial(), e),
        };
        self.requests.fail_stream(stream.serial(), &reason);

        let bound: Vec<Arc<Scope>> = self
            .scopes
            .read()
            .values()
            .filter(|scope| Arc::ptr_eq(scope.stream(), stream))
            .cloned()
            .collect();
        for scope in bound {
            scope.abort();
        }

        if let Err(e) = outcome {
            if !self.is_aborting() {
                self.report_error(e);
            }
        }
        if remaining == 0 && !self.is_closed() {
            info!(connection = %self.connection_id, "Last stream ended, aborting connection");
            self.abort();
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().streams.len()
    }

    /// Number of scopes placed on each stream.
    pub fn stream_scope_counts(&self) -> Vec<usize> {
        self.streams
            .lock()
            .streams
            .iter()
            .map(|s| s.scope_count())
            .collect()
    }

    /// Bytes written to the connection's current streams.
    pub fn bytes_written(&self) -> u64 {
        self.streams
            .lock()
            .streams
            .iter()
            .map(|s| s.bytes_written())
            .sum()
    }

    // ---- scopes ----

    /// Creates an anonymous scope with the peer.
    pub fn new_scope(self: &Arc<Self>) -> Result<Arc<Scope>> {
        self.create_scope(None)
    }

    /// Returns the scope called `name`, creating it if it does not exist.
    ///
    /// Each call adds a handle; the scope closes when every handle is
    /// closed.
    pub fn named_scope(self: &Arc<Self>, name: &str) -> Result<Arc<Scope>> {
        let cell = self.named_cell(name);
        let mut slot = cell.lock();
        if let Some(scope) = slot.as_ref() {
            if scope.acquire() {
                return Ok(scope.clone());
            }
        }
        let scope = self.create_scope(Some(name))?;
        *slot = Some(scope.clone());
        Ok(scope)
    }

    /// Lock guarding creation and last close of the scope called `name`.
    pub(crate) fn named_cell(&self, name: &str) -> Arc<Mutex<Option<Arc<Scope>>>> {
        self.named.lock().entry(name.to_string()).or_default().clone()
    }

    fn create_scope(self: &Arc<Self>, name: Option<&str>) -> Result<Arc<Scope>> {
        let stream = self.place_scope()?;
        let local_id = self.next_scope_id.fetch_add(1, Ordering::Relaxed);
        let scope = Arc::new(Scope::new(
            self.clone(),
            stream.clone(),
            local_id,
            NO_ID,
            name.map(str::to_string),
        ));
        self.scopes.write().insert(local_id, scope.clone());

        match self.request_peer_scope(&stream, local_id, name) {
            Ok(remote_id) => {
                scope.set_remote_id(remote_id);
                info!(
                    connection = %self.connection_id,
                    scope = local_id,
                    remote = remote_id,
                    name = name.unwrap_or(""),
                    stream = stream.serial(),
                    "Scope created"
                );
                Ok(scope)
            }
            Err(e) => {
                scope.abort();
                Err(e)
            }
        }
    }

    fn request_peer_scope(&self, stream: &Stream, local_id: u32, name: Option<&str>) -> Result<u32> {
        let pending = self.requests.new_request(stream.serial(), None)?;
        let mut w = WireWriter::new();
        w.write_u16(Command::NewVariables.code());
        w.write_u32(pending.id());
        w.write_u32(local_id);
        w.write_str(name.unwrap_or(""));
        stream.send(w.as_slice())?;

        match self.requests.wait_response(&pending, || {})? {
            Response::Variables { remote_id } if remote_id != NO_ID => Ok(remote_id),
            Response::Variables { .. } => Err(PeerlinkError::Protocol(match name {
                Some(name) => format!("Variables with name defined more than once: {}", name),
                None => "Peer refused to create variables".to_string(),
            })),
            Response::Failed { error, .. } => Err(error),
            _ => Err(PeerlinkError::Protocol("Unexpected response kind".to_string())),
        }
    }

    /// Creates this side of a scope the peer requested.
    pub(crate) fn accept_scope(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        remote_id: u32,
        name: Option<String>,
    ) -> Result<u32> {
        if self.is_aborting() {
            return Err(PeerlinkError::Closed("Connection closed".to_string()));
        }
        let local_id = self.next_scope_id.fetch_add(1, Ordering::Relaxed);
        let register = |name: Option<String>| {
            let scope = Arc::new(Scope::new(self.clone(), stream.clone(), local_id, remote_id, name));
            {
                let _set = self.streams.lock();
                stream.add_scope();
            }
            self.scopes.write().insert(local_id, scope.clone());
            scope
        };

        match name {
            Some(name) => {
                let cell = self.named_cell(&name);
                let mut slot = cell.lock();
                if slot.as_ref().is_some_and(|scope| !scope.is_aborting()) {
                    return Err(PeerlinkError::Protocol(format!(
                        "Variables with name defined more than once: {}",
                        name
                    )));
                }
                *slot = Some(register(Some(name)));
            }
            None => {
                register(None);
            }
        }
        debug!(connection = %self.connection_id, scope = local_id, remote = remote_id, "Accepted scope");
        Ok(local_id)
    }

    pub(crate) fn scope(&self, local_id: u32) -> Option<Arc<Scope>> {
        self.scopes.read().get(&local_id).cloned()
    }

    /// Number of open scopes.
    pub fn scope_count(&self) -> usize {
        self.scopes.read().len()
    }

    /// Called by a scope once it is fully closed.
    pub(crate) fn scope_closed(&self, scope: &Arc<Scope>) {
        {
            let mut scopes = self.scopes.write();
            if scopes
                .get(&scope.local_id())
                .is_some_and(|s| Arc::ptr_eq(s, scope))
            {
                scopes.remove(&scope.local_id());
            }
        }
        if let Some(name) = scope.name() {
            let cell = self.named.lock().get(name).cloned();
            // A creator holding the cell replaces the entry itself.
            if let Some(mut slot) = cell.as_ref().and_then(|cell| cell.try_lock()) {
                if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, scope)) {
                    *slot = None;
                }
            };
        }
        {
            let _set = self.streams.lock();
            scope.stream().remove_scope();
        }
        self.close_if_aborting_and_no_scopes();
    }

    /// Sweeps unreachable local objects of every scope.
    pub(crate) fn sweep_scopes(&self) {
        let scopes: Vec<Arc<Scope>> = self.scopes.read().values().cloned().collect();
        let swept: usize = scopes.iter().map(|scope| scope.sweep_unreachable()).sum();
        if swept > 0 {
            trace!(connection = %self.connection_id, swept, "Swept local objects");
        }
    }

    /// Queues work for the collector thread.
    pub(crate) fn collect(&self, event: GcEvent) {
        if let Some(sender) = self.gc.lock().as_ref() {
            let _ = sender.send(event);
        }
    }

    // ---- context variables ----

    /// Publishes `object` under `name` for the peer to look up.
    pub fn put_context_variable(&self, name: impl Into<String>, object: ObjectRef) {
        self.context_variables.write().insert(name.into(), object);
    }

    pub fn remove_context_variable(&self, name: &str) -> Option<ObjectRef> {
        self.context_variables.write().remove(name)
    }

    pub(crate) fn context_variable(&self, name: &str) -> Option<ObjectRef> {
        self.context_variables.read().get(name).cloned()
    }

    // ---- ping ----

    /// Sends a ping on the least loaded stream and waits for the pong.
    ///
    /// Returns the round-trip time.
    pub fn ping(&self) -> Result<Duration> {
        let stream = self
            .streams
            .lock()
            .streams
            .iter()
            .filter(|s| !s.is_closed())
            .min_by_key(|s| s.scope_count())
            .cloned()
            .ok_or_else(|| PeerlinkError::Closed("Connection has no live stream".to_string()))?;

        let start = Instant::now();
        let pending = self.requests.new_request(stream.serial(), None)?;
        let mut w = WireWriter::with_capacity(6);
        w.write_u16(Command::Ping.code());
        w.write_u32(pending.id());
        stream.send(w.as_slice())?;

        match self.requests.wait_response_interruptible(&pending)? {
            Response::Pong => Ok(start.elapsed()),
            Response::Failed { error, .. } => Err(error),
            _ => Err(PeerlinkError::Protocol("Unexpected response kind".to_string())),
        }
    }

    /// Number of outgoing requests waiting for an answer.
    pub fn pending_request_count(&self) -> usize {
        self.requests.pending_count()
    }

    // ---- lifecycle ----

    pub fn is_aborting(&self) -> bool {
        self.lifecycle.lock().aborting
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    /// Closes every scope, telling the peer, then the streams.
    ///
    /// Returns right away; scopes with requests in flight finish closing
    /// when those complete.
    pub fn close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return;
            }
            if !lifecycle.aborting {
                lifecycle.aborting = true;
                info!(connection = %self.connection_id, "Closing connection");
            }
        }
        let scopes: Vec<Arc<Scope>> = self.scopes.read().values().cloned().collect();
        for scope in scopes {
            scope.close_for_connection();
        }
        self.close_if_aborting_and_no_scopes();
    }

    /// Closes the connection and waits until it is closed and no incoming
    /// request is executing, or `timeout` elapses.
    ///
    /// Returns `true` if both happened.
    pub fn close_wait(&self, timeout: Option<Duration>) -> bool {
        self.close();
        if serving_request(self.serial) != NO_ID {
            warn!(connection = %self.connection_id, "close_wait called while serving a request, not waiting");
            return false;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        {
            let mut lifecycle = self.lifecycle.lock();
            while !lifecycle.closed {
                match deadline {
                    Some(deadline) => {
                        if self
                            .closed_signal
                            .wait_until(&mut lifecycle, deadline)
                            .timed_out()
                        {
                            return lifecycle.closed && self.pool.in_flight() == 0;
                        }
                    }
                    None => self.closed_signal.wait(&mut lifecycle),
                }
            }
        }
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.pool.wait_idle(remaining)
    }

    /// Tears the connection down without waiting for requests in flight.
    pub fn abort(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return;
            }
            lifecycle.aborting = true;
        }
        warn!(connection = %self.connection_id, "Aborting connection");
        let scopes: Vec<Arc<Scope>> = self.scopes.read().values().cloned().collect();
        for scope in scopes {
            scope.abort();
        }
        self.close_if_aborting_and_no_scopes();
    }

    fn close_if_aborting_and_no_scopes(&self) {
        if !self.scopes.read().is_empty() {
            return;
        }
        let listeners = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.aborting || lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
            std::mem::take(&mut lifecycle.close_listeners)
        };

        let streams = std::mem::take(&mut self.streams.lock().streams);
        for stream in &streams {
            stream.close(true);
        }
        self.requests.close();
        if let Some(sender) = self.gc.lock().take() {
            let _ = sender.send(GcEvent::Shutdown);
        }
        self.closed_signal.notify_all();
        info!(connection = %self.connection_id, "Connection closed");

        for listener in listeners {
            listener();
        }
    }

    fn report_error(&self, error: PeerlinkError) {
        let (error, listeners) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.error.is_some() {
                return;
            }
            let error = Arc::new(error);
            lifecycle.error = Some(error.clone());
            (error, std::mem::take(&mut lifecycle.error_listeners))
        };
        for (_, listener) in listeners {
            listener(&error);
        }
    }

    /// First error the connection ran into, if any.
    pub fn error(&self) -> Option<Arc<PeerlinkError>> {
        self.lifecycle.lock().error.clone()
    }

    /// Registers a listener for the first connection error. Fires right
    /// away if an error already happened.
    pub fn add_error_listener(
        &self,
        listener: impl FnOnce(&PeerlinkError) + Send + 'static,
    ) -> ListenerId {
        let mut lifecycle = self.lifecycle.lock();
        let id = ListenerId(lifecycle.next_listener);
        lifecycle.next_listener += 1;
        match lifecycle.error.clone() {
            Some(error) => {
                drop(lifecycle);
                listener(&error);
            }
            None => lifecycle.error_listeners.push((id, Box::new(listener))),
        }
        id
    }

    /// Removes an error listener that has not fired. Returns `false` if it
    /// was not registered anymore.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let before = lifecycle.error_listeners.len();
        lifecycle.error_listeners.retain(|(listener, _)| *listener != id);
        lifecycle.error_listeners.len() != before
    }

    /// Registers a listener for the connection closing. Fires right away
    /// if it is already closed.
    pub fn add_close_listener(&self, listener: impl FnOnce() + Send + 'static) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            drop(lifecycle);
            listener();
        } else {
            lifecycle.close_listeners.push(Box::new(listener));
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("connection_id", &self.connection_id)
            .field("version", &self.version)
            .field("streams", &self.stream_count())
            .field("scopes", &self.scope_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Collector thread: returns references of dropped proxies and sweeps
/// unreachable local objects.
fn collect_loop(events: Receiver<GcEvent>, connection: Weak<Connection>, interval: Duration) {
    let mut last_sweep = Instant::now();
    loop {
        match events.recv_timeout(interval) {
            Ok(GcEvent::ProxyDropped {
                scope,
                remote_id,
                serial,
            }) => scope.release_proxy(remote_id, serial),
            Ok(GcEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if last_sweep.elapsed() >= interval {
            match connection.upgrade() {
                Some(connection) => connection.sweep_scopes(),
                None => break,
            }
            last_sweep = Instant::now();
        }
    }
    trace!("Collector stopped");
}
