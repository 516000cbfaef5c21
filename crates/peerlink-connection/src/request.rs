//! Request correlation.
//!
//! Outgoing requests get a connection-wide id and a slot the calling
//! thread parks on. The stream reader completes the slot when the answer
//! arrives. While waiting, the caller may also be handed redispatch units:
//! incoming calls the peer needs served by this very thread because the
//! peer is itself blocked inside the call being waited on.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use parking_lot::Mutex;
use peerlink_common::{decompress_interrupt_status, PeerlinkError, Result, NO_ID};
use tracing::{debug, trace};

use crate::interrupt::{self, InterruptHandle};
use crate::value::Value;
use crate::variables::Scope;

/// Work handed to a waiting thread instead of the worker pool.
pub(crate) type RedispatchUnit = Box<dyn FnOnce() + Send + 'static>;

/// A decoded answer to an outgoing request.
pub(crate) enum Response {
    Method { status: i32, value: Value },
    NewInstance { status: i32, object_id: u32 },
    UnknownNewInstance { status: i32, object: Value },
    Variables { remote_id: u32 },
    ContextVariable(Value),
    Pong,
    Failed { status: Option<i32>, error: PeerlinkError },
}

impl Response {
    fn interrupt_status(&self) -> Option<i32> {
        match self {
            Response::Method { status, .. }
            | Response::NewInstance { status, .. }
            | Response::UnknownNewInstance { status, .. } => Some(*status),
            Response::Failed { status, .. } => *status,
            _ => None,
        }
    }
}

struct SlotState {
    response: Option<Response>,
    redispatch: VecDeque<RedispatchUnit>,
    finished: bool,
}

impl Slot {
    fn complete(&self, response: Response) {
        let mut state = self.state.lock();
        state.response = Some(response);
        state.finished = true;
        drop(state);
        self.waiter.unpark();
    }

    /// Marks the slot finished and returns units nobody will pick up.
    fn abandon(&self) -> VecDeque<RedispatchUnit> {
        let mut state = self.state.lock();
        state.finished = true;
        std::mem::take(&mut state.redispatch)
    }
}

struct Slot {
    waiter: Thread,
    stream: u64,
    scope: Option<Arc<Scope>>,
    state: Mutex<SlotState>,
}

/// A registered outgoing request. Dropping it without an answer removes
/// the slot, so a late answer is ignored.
pub(crate) struct PendingRequest<'a> {
    id: u32,
    slot: Arc<Slot>,
    handler: &'a RequestHandler,
}

impl PendingRequest<'_> {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.handler.remove(self.id);
        for unit in self.slot.abandon() {
            unit();
        }
    }
}

struct Table {
    closed: bool,
    slots: HashMap<u32, Arc<Slot>>,
}

/// Correlates outgoing requests with their answers.
pub(crate) struct RequestHandler {
    next_id: AtomicU32,
    table: Mutex<Table>,
}

impl RequestHandler {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            table: Mutex::new(Table {
                closed: false,
                slots: HashMap::new(),
            }),
        }
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != NO_ID {
                return id;
            }
        }
    }

    /// Registers a request sent on `stream` by the calling thread.
    ///
    /// `scope` is the scope the answer's values are decoded against.
    pub(crate) fn new_request(
        &self,
        stream: u64,
        scope: Option<Arc<Scope>>,
    ) -> Result<PendingRequest<'_>> {
        let slot = Arc::new(Slot {
            waiter: thread::current(),
            stream,
            scope,
            state: Mutex::new(SlotState {
                response: None,
                redispatch: VecDeque::new(),
                finished: false,
            }),
        });
        let id = self.allocate_id();
        let mut table = self.table.lock();
        if table.closed {
            return Err(PeerlinkError::Closed("Connection closed".to_string()));
        }
        table.slots.insert(id, slot.clone());
        Ok(PendingRequest {
            id,
            slot,
            handler: self,
        })
    }

    /// Scope an answer to `id` is decoded against, if the request is
    /// still pending.
    pub(crate) fn scope_of(&self, id: u32) -> Option<Option<Arc<Scope>>> {
        self.table.lock().slots.get(&id).map(|slot| slot.scope.clone())
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.table.lock().slots.contains_key(&id)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Completes request `id`. Returns `false` if nobody waits for it
    /// anymore; the answer is dropped.
    pub(crate) fn add_response(&self, id: u32, response: Response) -> bool {
        let slot = self.table.lock().slots.remove(&id);
        match slot {
            Some(slot) => {
                slot.complete(response);
                true
            }
            None => {
                debug!(request_id = id, "Ignoring response for unknown request");
                false
            }
        }
    }

    /// Hands `unit` to the thread waiting on request `dispatch_id`.
    ///
    /// Gives the unit back if that request is no longer pending.
    pub(crate) fn add_redispatch(
        &self,
        dispatch_id: u32,
        unit: RedispatchUnit,
    ) -> std::result::Result<(), RedispatchUnit> {
        let slot = self.table.lock().slots.get(&dispatch_id).cloned();
        match slot {
            Some(slot) => {
                let mut state = slot.state.lock();
                if state.finished {
                    return Err(unit);
                }
                state.redispatch.push_back(unit);
                drop(state);
                slot.waiter.unpark();
                Ok(())
            }
            None => Err(unit),
        }
    }

    /// Fails every request that was sent on `stream`.
    pub(crate) fn fail_stream(&self, stream: u64, reason: &str) {
        let failed: Vec<Arc<Slot>> = {
            let mut table = self.table.lock();
            let ids: Vec<u32> = table
                .slots
                .iter()
                .filter(|(_, slot)| slot.stream == stream)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| table.slots.remove(id)).collect()
        };
        for slot in failed {
            slot.complete(Response::Failed {
                status: None,
                error: PeerlinkError::Transport(reason.to_string()),
            });
        }
    }

    /// Wakes every waiter with a closed failure. Later requests fail and
    /// later answers are dropped.
    pub(crate) fn close(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            slot.complete(Response::Failed {
                status: None,
                error: PeerlinkError::Closed("Connection closed".to_string()),
            });
        }
    }

    fn remove(&self, id: u32) {
        self.table.lock().slots.remove(&id);
    }

    /// Waits for the answer to `request`, tracking interrupts.
    ///
    /// Each interrupt of the waiting thread is reported through
    /// `on_interrupt` (which forwards it to the peer) and counted; the wait
    /// goes on. When the answer arrives the thread's interrupt flag is
    /// restored: set if the remote execution ended interrupted, or if
    /// fewer interrupts reached it than were sent.
    pub(crate) fn wait_response(
        &self,
        request: &PendingRequest<'_>,
        mut on_interrupt: impl FnMut(),
    ) -> Result<Response> {
        let mut sent = 0u32;
        let response = loop {
            if let Some(response) = self.poll(request) {
                break response;
            }
            if interrupt::interrupted() {
                sent += 1;
                trace!(request_id = request.id, sent, "Forwarding interrupt");
                on_interrupt();
                continue;
            }
            thread::park();
        };

        match response.interrupt_status() {
            Some(status) => {
                let (remote_interrupted, delivered) = decompress_interrupt_status(status);
                if remote_interrupted || delivered < sent {
                    interrupt::set_interrupted();
                }
            }
            None if sent > 0 => interrupt::set_interrupted(),
            None => {}
        }
        Ok(response)
    }

    /// Waits for the answer to `request`, giving up as soon as the thread
    /// is interrupted. The interrupt flag stays set in that case.
    pub(crate) fn wait_response_interruptible(
        &self,
        request: &PendingRequest<'_>,
    ) -> Result<Response> {
        loop {
            if let Some(response) = self.poll(request) {
                return Ok(response);
            }
            if interrupt::is_interrupted() {
                self.remove(request.id);
                for unit in request.slot.abandon() {
                    unit();
                }
                return Err(PeerlinkError::Interrupted);
            }
            thread::park();
        }
    }

    /// Runs queued redispatch units, then takes the answer if present.
    fn poll(&self, request: &PendingRequest<'_>) -> Option<Response> {
        loop {
            let unit = {
                let mut state = request.slot.state.lock();
                match state.redispatch.pop_front() {
                    Some(unit) => unit,
                    None => return state.response.take(),
                }
            };
            trace!(request_id = request.id, "Running redispatched call");
            unit();
        }
    }
}

thread_local! {
    static SERVING: Cell<Option<(u64, u32)>> = const { Cell::new(None) };
}

/// Id of the peer request the calling thread is serving on `connection`,
/// or [`NO_ID`].
pub(crate) fn serving_request(connection: u64) -> u32 {
    SERVING.with(|cell| match cell.get() {
        Some((serial, id)) if serial == connection => id,
        _ => NO_ID,
    })
}

/// Marks the calling thread as serving a peer request until dropped.
pub(crate) struct ServingGuard {
    previous: Option<(u64, u32)>,
}

impl ServingGuard {
    pub(crate) fn enter(connection: u64, request_id: u32) -> Self {
        let previous = SERVING.with(|cell| cell.replace(Some((connection, request_id))));
        Self { previous }
    }
}

impl Drop for ServingGuard {
    fn drop(&mut self) {
        SERVING.with(|cell| cell.set(self.previous));
    }
}

#[derive(Default)]
struct ServingEntry {
    handle: Option<InterruptHandle>,
    delivered: u32,
    pending_interrupt: bool,
}

/// Threads currently executing peer requests, by peer request id.
///
/// Entries are registered when a request is queued, so an interrupt that
/// arrives before execution starts is kept and applied on start.
#[derive(Default)]
pub(crate) struct ServingTable {
    entries: Mutex<HashMap<u32, ServingEntry>>,
}

impl ServingTable {
    pub(crate) fn register(&self, request_id: u32) {
        if request_id != NO_ID {
            self.entries.lock().entry(request_id).or_default();
        }
    }

    /// Binds the calling thread to `request_id`.
    pub(crate) fn start(&self, request_id: u32) {
        if request_id == NO_ID {
            return;
        }
        interrupt::interrupted();
        let mut entries = self.entries.lock();
        let entry = entries.entry(request_id).or_default();
        entry.handle = Some(interrupt::current());
        if std::mem::take(&mut entry.pending_interrupt) {
            interrupt::set_interrupted();
        }
    }

    /// Delivers an interrupt request. Returns `false` for unknown ids.
    pub(crate) fn interrupt(&self, request_id: u32) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&request_id) {
            Some(entry) => {
                entry.delivered += 1;
                match &entry.handle {
                    Some(handle) => handle.interrupt(),
                    None => entry.pending_interrupt = true,
                }
                true
            }
            None => false,
        }
    }

    /// Unbinds `request_id`, clearing the calling thread's interrupt flag.
    ///
    /// Returns `(was_interrupted, delivered)` for the answer.
    pub(crate) fn finish(&self, request_id: u32) -> (bool, u32) {
        let interrupted = interrupt::interrupted();
        if request_id == NO_ID {
            return (interrupted, 0);
        }
        let delivered = self
            .entries
            .lock()
            .remove(&request_id)
            .map_or(0, |entry| entry.delivered);
        (interrupted, delivered)
    }

    /// Drops an entry whose request never started.
    pub(crate) fn discard(&self, request_id: u32) {
        self.entries.lock().remove(&request_id);
    }
}
