//! Incoming command blocks.
//!
//! The stream reader decodes every block here. Answers complete pending
//! requests; calls and constructions are decoded on the reader thread and
//! executed on the worker pool, or on the thread of ours that the peer is
//! blocked on when the block is a redispatch.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use peerlink_common::transport::{WireReader, WireWriter};
use peerlink_common::{
    compress_interrupt_status, Command, MethodDescriptor, PeerlinkError, RemoteFailure, Result,
    NO_ID,
};
use tracing::{debug, trace, warn};

use crate::cache::CacheKind;
use crate::codec::{encode_command, ValueReader};
use crate::connection::Connection;
use crate::interrupt;
use crate::object::ObjectRef;
use crate::registry::{ConstructorFn, StaticMethodFn};
use crate::request::{RedispatchUnit, Response, ServingGuard};
use crate::stream::Stream;
use crate::transfer::WriterKind;
use crate::value::Value;
use crate::variables::Scope;

const DIRECT_REQUESTS_FORBIDDEN: &str = "Direct requests are forbidden.";

enum Target {
    Object(ObjectRef),
    Static(StaticMethodFn),
}

impl Target {
    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        match self {
            Target::Object(obj) => obj.invoke(method, args),
            Target::Static(f) => f(args),
        }
    }
}

struct Call {
    scope: Arc<Scope>,
    target: Target,
    method: MethodDescriptor,
    args: Vec<Value>,
}

struct Construction {
    scope: Arc<Scope>,
    construct: ConstructorFn,
    args: Vec<Value>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Invocation panicked: {}", detail)
}

fn no_interrupts() -> i32 {
    compress_interrupt_status(false, 0)
}

impl Connection {
    /// Handles one block received on `stream`.
    ///
    /// Errors that are not fatal to the stream have already been answered
    /// to the peer where an answer is expected.
    pub(crate) fn handle_block(self: &Arc<Self>, stream: &Arc<Stream>, block: &[u8]) -> Result<()> {
        let mut input = WireReader::new(block);
        let command = Command::try_from(input.read_u16()?)?;
        trace!(stream = stream.serial(), ?command, len = block.len(), "Handling command");

        match command {
            Command::MethodCall => self.on_method_call(stream, input, false),
            Command::MethodCallRedispatch => self.on_method_call(stream, input, true),
            Command::NewInstance => self.on_new_instance(stream, input, false),
            Command::NewInstanceRedispatch => self.on_new_instance(stream, input, true),
            Command::NewInstanceUnknownClass => self.on_new_unknown_instance(stream, input, false),
            Command::NewInstanceUnknownClassRedispatch => {
                self.on_new_unknown_instance(stream, input, true)
            }
            Command::MethodCallContextVar => self.on_context_variable_call(stream, input, false),
            Command::MethodCallContextVarRedispatch => {
                self.on_context_variable_call(stream, input, true)
            }
            Command::MethodCallAsync => self.on_async_call(stream, input, false),
            Command::MethodCallAsyncWithResponse => self.on_async_call(stream, input, true),
            Command::GetContextVar => self.on_get_context_variable(stream, input),
            Command::NewVariables => self.on_new_variables(stream, input),
            Command::CloseVariables => {
                let id = input.read_u32()?;
                match self.scope(id) {
                    Some(scope) => scope.close_from_peer(),
                    None => debug!(scope = id, "Close for unknown scope"),
                }
                Ok(())
            }
            Command::ReferencesReleased => {
                let scope_id = input.read_u32()?;
                let object_id = input.read_u32()?;
                let count = input.read_u32()?;
                match self.scope(scope_id) {
                    Some(scope) => {
                        if let Err(e) = scope.references_released(object_id, u64::from(count)) {
                            warn!(scope = scope_id, object = object_id, error = %e, "Invalid release");
                        }
                    }
                    None => debug!(scope = scope_id, "Release for unknown scope"),
                }
                Ok(())
            }
            Command::AsyncResponse => {
                let id = input.read_u32()?;
                match self.scope(id) {
                    Some(scope) => scope.end_request(),
                    None => debug!(scope = id, "Asynchronous acknowledgement for unknown scope"),
                }
                Ok(())
            }
            Command::StreamClosed => {
                debug!(stream = stream.serial(), "Peer closed stream");
                stream.mark_closed_by_peer();
                Ok(())
            }
            Command::Ping => {
                let request_id = input.read_u32()?;
                let mut w = WireWriter::with_capacity(6);
                w.write_u16(Command::Pong.code());
                w.write_u32(request_id);
                self.send_quietly(stream, w.as_slice());
                Ok(())
            }
            Command::InterruptRequest => {
                let request_id = input.read_u32()?;
                if !self.serving().interrupt(request_id) {
                    debug!(request_id, "Interrupt for a request not being served");
                }
                Ok(())
            }
            Command::CachedClass => stream.write_cache().apply_announcement(CacheKind::Type, &mut input),
            Command::CachedMethod => {
                stream.write_cache().apply_announcement(CacheKind::Method, &mut input)
            }
            Command::CachedConstructor => {
                stream.write_cache().apply_announcement(CacheKind::Constructor, &mut input)
            }
            Command::CachedClassLoader => {
                stream.write_cache().apply_announcement(CacheKind::Context, &mut input)
            }
            Command::CachedField => stream.write_cache().apply_announcement(CacheKind::Field, &mut input),
            Command::MethodResult
            | Command::NewInstanceResult
            | Command::MethodResultFail
            | Command::NewInstanceResultFail
            | Command::GetContextVarResponse
            | Command::NewVariablesResult
            | Command::UnknownNewInstanceResult
            | Command::Pong
            | Command::DirectRequestForbidden
            | Command::MethodCallContextVarNotFound => self.on_response(stream, command, input),
        }
    }

    // ---- answers ----

    /// Hands an answer to the waiting request. A value that fails to read
    /// drops the proxies it already built, which releases their references.
    fn on_response(&self, stream: &Stream, command: Command, input: WireReader<'_>) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let request_id = reader.wire().read_u32()?;
        let Some(scope) = self.requests().scope_of(request_id) else {
            debug!(request_id, ?command, "Ignoring late response");
            return Ok(());
        };
        reader.set_scope(scope.clone());

        let response = match command {
            Command::MethodResult => {
                let status = reader.wire().read_i32()?;
                match reader.read_value() {
                    Ok(value) => Response::Method { status, value },
                    Err(e) if e.is_stream_fatal() => return Err(e),
                    Err(error) => Response::Failed {
                        status: Some(status),
                        error,
                    },
                }
            }
            Command::NewInstanceResult => {
                let object_id = reader.wire().read_u32()?;
                let status = reader.wire().read_i32()?;
                Response::NewInstance { status, object_id }
            }
            Command::UnknownNewInstanceResult => {
                let _scope_id = reader.wire().read_u32()?;
                let status = reader.wire().read_i32()?;
                let object_id = reader.wire().read_u32()?;
                let object = reader.read_interfaces().and_then(|interfaces| {
                    let scope = scope.as_ref().ok_or_else(|| {
                        PeerlinkError::TransferFailure("Remote reference outside of a scope".to_string())
                    })?;
                    Ok(Value::Object(scope.proxy_for(object_id, interfaces)))
                });
                match object {
                    Ok(object) => Response::UnknownNewInstance { status, object },
                    Err(e) if e.is_stream_fatal() => return Err(e),
                    Err(error) => Response::Failed {
                        status: Some(status),
                        error,
                    },
                }
            }
            Command::MethodResultFail | Command::NewInstanceResultFail => {
                let status = reader.wire().read_i32()?;
                let payload = reader.wire().read_bytes()?;
                let error = match RemoteFailure::decode(payload) {
                    Ok(failure) => failure.into_error(),
                    Err(e) => e,
                };
                Response::Failed {
                    status: Some(status),
                    error,
                }
            }
            Command::GetContextVarResponse => match reader.read_value() {
                Ok(value) => Response::ContextVariable(value),
                Err(e) if e.is_stream_fatal() => return Err(e),
                Err(error) => Response::Failed {
                    status: None,
                    error,
                },
            },
            Command::NewVariablesResult => Response::Variables {
                remote_id: reader.wire().read_u32()?,
            },
            Command::Pong => Response::Pong,
            Command::DirectRequestForbidden => Response::Failed {
                status: None,
                error: PeerlinkError::Forbidden(DIRECT_REQUESTS_FORBIDDEN.to_string()),
            },
            Command::MethodCallContextVarNotFound => {
                let name = reader.wire().read_str()?;
                Response::Failed {
                    status: None,
                    error: PeerlinkError::CallFailed(format!("Context variable not found: {}", name)),
                }
            }
            other => {
                return Err(PeerlinkError::Protocol(format!("Not a response: {:?}", other)));
            }
        };
        drop(reader);

        self.requests().add_response(request_id, response);
        Ok(())
    }

    // ---- requests ----

    fn scope_for(&self, id: u32) -> Result<Arc<Scope>> {
        self.scope(id)
            .filter(|scope| !scope.is_closed())
            .ok_or_else(|| PeerlinkError::TransferFailure(format!("Variables not found for id: {}", id)))
    }

    fn check_direct_requests(&self) -> Result<()> {
        if self.options().allow_direct_requests {
            Ok(())
        } else {
            Err(PeerlinkError::Forbidden(DIRECT_REQUESTS_FORBIDDEN.to_string()))
        }
    }

    /// Decodes `[dispatch]?[vars][object][method][params]`.
    fn read_method_call(&self, reader: &mut ValueReader<'_, '_>, redispatch: bool) -> Result<(u32, Call)> {
        let dispatch = if redispatch {
            reader.wire().read_u32()?
        } else {
            NO_ID
        };
        let scope = self.scope_for(reader.wire().read_u32()?)?;
        reader.set_scope(Some(scope.clone()));
        let object_id = reader.wire().read_u32()?;
        let method = reader.read_method()?;

        let target = if object_id == NO_ID {
            self.check_direct_requests()?;
            Target::Static(self.options().registry.static_method(&method)?)
        } else {
            let obj = scope.local_object(object_id).ok_or_else(|| {
                PeerlinkError::TransferFailure(format!("Object not found for id: {}", object_id))
            })?;
            Target::Object(obj)
        };
        let args = reader.read_args(method.params().len())?;
        Ok((
            dispatch,
            Call {
                scope,
                target,
                method,
                args,
            },
        ))
    }

    fn on_method_call(self: &Arc<Self>, stream: &Arc<Stream>, input: WireReader<'_>, redispatch: bool) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let request_id = reader.wire().read_u32()?;
        let decoded = self.read_method_call(&mut reader, redispatch);
        drop(reader);
        let (dispatch, call) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(stream, Command::MethodResultFail, request_id, e),
        };
        self.schedule_call(stream, request_id, dispatch, call);
        Ok(())
    }

    fn schedule_call(self: &Arc<Self>, stream: &Arc<Stream>, request_id: u32, dispatch: u32, call: Call) {
        let connection = self.clone();
        let stream = stream.clone();
        self.schedule(request_id, dispatch, move || {
            let Call {
                scope,
                target,
                method,
                args,
            } = call;
            let (result, status) = connection.run_serving(request_id, || target.invoke(&method, args));
            connection.send_method_result(&stream, &scope, request_id, &method, result, status);
        });
    }

    fn on_context_variable_call(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        input: WireReader<'_>,
        redispatch: bool,
    ) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let request_id = reader.wire().read_u32()?;
        let decoded = (|| -> Result<std::result::Result<(u32, Call), String>> {
            let scope = self.scope_for(reader.wire().read_u32()?)?;
            reader.set_scope(Some(scope.clone()));
            let dispatch = if redispatch {
                reader.wire().read_u32()?
            } else {
                NO_ID
            };
            let name = reader.wire().read_str()?;
            let method = reader.read_method()?;
            let Some(obj) = self.context_variable(&name) else {
                return Ok(Err(name));
            };
            let args = reader.read_args(method.params().len())?;
            Ok(Ok((
                dispatch,
                Call {
                    scope,
                    target: Target::Object(obj),
                    method,
                    args,
                },
            )))
        })();
        drop(reader);

        match decoded {
            Ok(Ok((dispatch, call))) => {
                self.schedule_call(stream, request_id, dispatch, call);
                Ok(())
            }
            Ok(Err(name)) => {
                debug!(request_id, name = %name, "Context variable not found");
                let mut w = WireWriter::new();
                w.write_u16(Command::MethodCallContextVarNotFound.code());
                w.write_u32(request_id);
                w.write_str(&name);
                self.send_quietly(stream, w.as_slice());
                Ok(())
            }
            Err(e) => self.reject(stream, Command::MethodResultFail, request_id, e),
        }
    }

    fn on_new_instance(self: &Arc<Self>, stream: &Arc<Stream>, input: WireReader<'_>, redispatch: bool) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let request_id = reader.wire().read_u32()?;
        let decoded = (|| -> Result<(u32, Construction)> {
            let dispatch = if redispatch {
                reader.wire().read_u32()?
            } else {
                NO_ID
            };
            let scope = self.scope_for(reader.wire().read_u32()?)?;
            reader.set_scope(Some(scope.clone()));
            let ctor = reader.read_constructor()?;
            self.check_direct_requests()?;
            let construct = self.options().registry.constructor(&ctor)?;
            let args = reader.read_args(ctor.params().len())?;
            Ok((
                dispatch,
                Construction {
                    scope,
                    construct,
                    args,
                },
            ))
        })();
        drop(reader);

        let (dispatch, construction) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(stream, Command::NewInstanceResultFail, request_id, e),
        };
        let connection = self.clone();
        let stream = stream.clone();
        self.schedule(request_id, dispatch, move || {
            let Construction {
                scope,
                construct,
                args,
            } = construction;
            let (result, status) = connection.run_serving(request_id, || construct(args));
            let block = result.and_then(|obj| {
                encode_command(&scope, Command::NewInstanceResult, |w| {
                    w.wire().write_u32(request_id);
                    let id = w.expose(&obj)?;
                    w.wire().write_u32(id);
                    w.wire().write_i32(status);
                    Ok(())
                })
            });
            match block {
                Ok(block) => connection.send_quietly(&stream, &block),
                Err(e) => connection.send_failure(&stream, Command::NewInstanceResultFail, request_id, status, &e),
            }
        });
        Ok(())
    }

    fn on_new_unknown_instance(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        input: WireReader<'_>,
        redispatch: bool,
    ) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let request_id = reader.wire().read_u32()?;
        let decoded = (|| -> Result<(u32, Construction)> {
            let dispatch = if redispatch {
                reader.wire().read_u32()?
            } else {
                NO_ID
            };
            let scope = self.scope_for(reader.wire().read_u32()?)?;
            reader.set_scope(Some(scope.clone()));
            let context = reader.read_context()?;
            let type_name = reader.wire().read_str()?;
            let n = reader.wire().read_u16()? as usize;
            let param_types = (0..n)
                .map(|_| reader.wire().read_str())
                .collect::<Result<Vec<String>>>()?;
            self.check_direct_requests()?;
            let construct =
                self.options()
                    .registry
                    .constructor_by_name(context.as_ref(), &type_name, &param_types)?;
            let args = reader.read_args(n)?;
            Ok((
                dispatch,
                Construction {
                    scope,
                    construct,
                    args,
                },
            ))
        })();
        drop(reader);

        let (dispatch, construction) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(stream, Command::NewInstanceResultFail, request_id, e),
        };
        let connection = self.clone();
        let stream = stream.clone();
        self.schedule(request_id, dispatch, move || {
            let Construction {
                scope,
                construct,
                args,
            } = construction;
            let (result, status) = connection.run_serving(request_id, || construct(args));
            let block = result.and_then(|obj| {
                let interfaces = connection
                    .options()
                    .registry
                    .reduce_interfaces(&obj.interfaces());
                encode_command(&scope, Command::UnknownNewInstanceResult, |w| {
                    w.wire().write_u32(request_id);
                    w.wire().write_u32(scope.remote_id());
                    w.wire().write_i32(status);
                    let id = w.expose(&obj)?;
                    w.wire().write_u32(id);
                    w.write_interfaces(&interfaces)
                })
            });
            match block {
                Ok(block) => connection.send_quietly(&stream, &block),
                Err(e) => connection.send_failure(&stream, Command::NewInstanceResultFail, request_id, status, &e),
            }
        });
        Ok(())
    }

    fn on_async_call(self: &Arc<Self>, stream: &Arc<Stream>, input: WireReader<'_>, with_response: bool) -> Result<()> {
        let mut reader = ValueReader::new(self, stream, input);
        let caller = if with_response {
            Some(reader.wire().read_u32()?)
        } else {
            None
        };
        let decoded = self.read_method_call(&mut reader, false);
        drop(reader);

        let call = match decoded {
            Ok((_, call)) => call,
            Err(e) if e.is_stream_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Dropping asynchronous call");
                if let Some(caller) = caller {
                    self.send_async_response(stream, caller);
                }
                return Ok(());
            }
        };
        let connection = self.clone();
        let stream = stream.clone();
        self.schedule(NO_ID, NO_ID, move || {
            let Call {
                target,
                method,
                args,
                ..
            } = call;
            let (result, _) = connection.run_serving(NO_ID, || target.invoke(&method, args));
            if let Err(e) = result {
                debug!(method = %method, error = %e, "Asynchronous call failed");
            }
            if let Some(caller) = caller {
                connection.send_async_response(&stream, caller);
            }
        });
        Ok(())
    }

    fn send_async_response(&self, stream: &Stream, caller_scope: u32) {
        let mut w = WireWriter::with_capacity(6);
        w.write_u16(Command::AsyncResponse.code());
        w.write_u32(caller_scope);
        self.send_quietly(stream, w.as_slice());
    }

    fn on_get_context_variable(&self, stream: &Arc<Stream>, mut input: WireReader<'_>) -> Result<()> {
        let request_id = input.read_u32()?;
        let scope_id = input.read_u32()?;
        let name = input.read_str()?;
        let scope = match self.scope_for(scope_id) {
            Ok(scope) => scope,
            Err(e) => return self.reject(stream, Command::MethodResultFail, request_id, e),
        };
        let value = self
            .context_variable(&name)
            .map(Value::Object)
            .unwrap_or(Value::Null);
        let block = encode_command(&scope, Command::GetContextVarResponse, |w| {
            w.wire().write_u32(request_id);
            w.write_value(&value, &WriterKind::Remote)
        });
        match block {
            Ok(block) => self.send_quietly(stream, &block),
            Err(e) => self.send_failure(stream, Command::MethodResultFail, request_id, no_interrupts(), &e),
        }
        Ok(())
    }

    fn on_new_variables(self: &Arc<Self>, stream: &Arc<Stream>, mut input: WireReader<'_>) -> Result<()> {
        let request_id = input.read_u32()?;
        let remote_id = input.read_u32()?;
        let name = input.read_str()?;
        let name = (!name.is_empty()).then_some(name);
        let local_id = match self.accept_scope(stream, remote_id, name) {
            Ok(id) => id,
            Err(e) => {
                warn!(remote = remote_id, error = %e, "Refused to create variables");
                NO_ID
            }
        };
        let mut w = WireWriter::with_capacity(10);
        w.write_u16(Command::NewVariablesResult.code());
        w.write_u32(request_id);
        w.write_u32(local_id);
        self.send_quietly(stream, w.as_slice());
        Ok(())
    }

    // ---- execution ----

    /// Queues `job` for peer request `request_id`. A redispatched request
    /// goes to the thread waiting on request `dispatch` if that wait is
    /// still going on.
    fn schedule(self: &Arc<Self>, request_id: u32, dispatch: u32, job: impl FnOnce() + Send + 'static) {
        self.serving().register(request_id);
        let mut unit: RedispatchUnit = Box::new(job);
        if dispatch != NO_ID {
            match self.requests().add_redispatch(dispatch, unit) {
                Ok(()) => {
                    trace!(request_id, dispatch, "Redispatched to waiting thread");
                    return;
                }
                Err(returned) => unit = returned,
            }
        }
        self.pool().execute(unit);
    }

    /// Runs `f` as the execution of peer request `request_id`.
    ///
    /// Returns the result with the compressed interrupt status for the
    /// answer. The thread's own interrupt flag is restored afterwards.
    fn run_serving<T>(&self, request_id: u32, f: impl FnOnce() -> Result<T>) -> (Result<T>, i32) {
        let outer = interrupt::interrupted();
        self.serving().start(request_id);
        let result = {
            let _serving = ServingGuard::enter(self.serial(), request_id);
            panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(PeerlinkError::CallFailed(panic_message(payload))))
        };
        let (interrupted, delivered) = self.serving().finish(request_id);
        if outer {
            interrupt::set_interrupted();
        }
        (result, compress_interrupt_status(interrupted, delivered))
    }

    fn send_method_result(
        &self,
        stream: &Stream,
        scope: &Arc<Scope>,
        request_id: u32,
        method: &MethodDescriptor,
        result: Result<Value>,
        status: i32,
    ) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                return self.send_failure(stream, Command::MethodResultFail, request_id, status, &e)
            }
        };
        let properties = self.options().transfer_properties.method(method);
        let block = encode_command(scope, Command::MethodResult, |w| {
            w.wire().write_u32(request_id);
            w.wire().write_i32(status);
            w.write_value(&value, &properties.return_writer)
        });
        match block {
            Ok(block) => self.send_quietly(stream, &block),
            Err(e) => self.send_failure(stream, Command::MethodResultFail, request_id, status, &e),
        }
    }

    /// Answers a request that could not be decoded or is not allowed.
    fn reject(&self, stream: &Stream, fail: Command, request_id: u32, error: PeerlinkError) -> Result<()> {
        if error.is_stream_fatal() {
            return Err(error);
        }
        if matches!(&error, PeerlinkError::Forbidden(msg) if msg == DIRECT_REQUESTS_FORBIDDEN) {
            debug!(request_id, "Refusing direct request");
            let mut w = WireWriter::with_capacity(6);
            w.write_u16(Command::DirectRequestForbidden.code());
            w.write_u32(request_id);
            self.send_quietly(stream, w.as_slice());
        } else {
            self.send_failure(stream, fail, request_id, no_interrupts(), &error);
        }
        Ok(())
    }

    fn send_failure(&self, stream: &Stream, command: Command, request_id: u32, status: i32, error: &PeerlinkError) {
        debug!(request_id, ?command, error = %error, "Answering with failure");
        let payload = match RemoteFailure::from_error(error).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(request_id, error = %e, "Failed to encode failure");
                return;
            }
        };
        let mut w = WireWriter::with_capacity(14 + payload.len());
        w.write_u16(command.code());
        w.write_u32(request_id);
        w.write_i32(status);
        w.write_bytes(&payload);
        self.send_quietly(stream, w.as_slice());
    }

    fn send_quietly(&self, stream: &Stream, block: &[u8]) {
        if let Err(e) = stream.send(block) {
            debug!(stream = stream.serial(), error = %e, "Failed to send answer");
        }
    }
}
