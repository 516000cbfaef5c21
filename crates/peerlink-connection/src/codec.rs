//! Value encoding inside command blocks.
//!
//! Every value starts with a `u16` tag. Descriptors at the top level of a
//! value use the per-stream caches: the full details the first time, the
//! peer's index once it has announced one. Objects are written by the
//! [`WriterKind`] that applies to them, which usually exposes them in the
//! scope and sends a new remote reference.

use std::sync::Arc;

use peerlink_common::transport::{WireReader, WireWriter};
use peerlink_common::{
    descriptor_tag, tag, Command, ConstructorDescriptor, ContextId, FieldDescriptor,
    MethodDescriptor, PeerlinkError, Result, TypeDescriptor,
};
use peerlink_metrics::StatisticsCollector;
use tracing::{debug, warn};

use crate::cache::{
    read_constructor_details, read_field_details, read_method_details, read_type_details,
    write_constructor_details, write_field_details, write_method_details, write_type_details,
};
use crate::connection::Connection;
use crate::object::ObjectRef;
use crate::registry::TypeRegistry;
use crate::stream::Stream;
use crate::transfer::{TransferProperties, WriterKind};
use crate::value::{SerializedValue, Value};
use crate::variables::Scope;

/// Encodes one command block for `scope`.
///
/// If `body` fails, every object it exposed is rolled back so the failed
/// block leaves no reference count behind.
pub(crate) fn encode_command(
    scope: &Arc<Scope>,
    command: Command,
    body: impl FnOnce(&mut ValueWriter<'_>) -> Result<()>,
) -> Result<Vec<u8>> {
    let mut writer = ValueWriter::new(scope, command);
    match body(&mut writer) {
        Ok(()) => Ok(writer.out.into_inner()),
        Err(e) => {
            scope.rollback_exposures(&writer.exposed);
            Err(e)
        }
    }
}

/// Writes values of one block, exposing objects in a scope.
pub(crate) struct ValueWriter<'a> {
    out: WireWriter,
    scope: &'a Arc<Scope>,
    exposed: Vec<u32>,
}

impl<'a> ValueWriter<'a> {
    fn new(scope: &'a Arc<Scope>, command: Command) -> Self {
        let mut out = WireWriter::new();
        out.write_u16(command.code());
        Self {
            out,
            scope,
            exposed: Vec::new(),
        }
    }

    pub(crate) fn wire(&mut self) -> &mut WireWriter {
        &mut self.out
    }

    fn stream(&self) -> &'a Stream {
        let scope: &'a Arc<Scope> = self.scope;
        scope.stream()
    }

    fn registry(&self) -> &'a TypeRegistry {
        let scope: &'a Arc<Scope> = self.scope;
        &scope.connection().options().registry
    }

    fn properties(&self) -> &'a TransferProperties {
        let scope: &'a Arc<Scope> = self.scope;
        &scope.connection().options().transfer_properties
    }

    pub(crate) fn write_type(&mut self, ty: &TypeDescriptor) {
        match self.stream().write_cache().type_index(ty) {
            Some(index) => {
                self.out.write_u16(descriptor_tag::INDEX);
                self.out.write_u32(index);
            }
            None => {
                self.out.write_u16(descriptor_tag::DETAILS);
                write_type_details(&mut self.out, ty);
            }
        }
    }

    pub(crate) fn write_method(&mut self, method: &MethodDescriptor) {
        match self.stream().write_cache().method_index(method) {
            Some(index) => {
                self.out.write_u16(descriptor_tag::INDEX);
                self.out.write_u32(index);
            }
            None => {
                self.out.write_u16(descriptor_tag::DETAILS);
                write_method_details(&mut self.out, method);
            }
        }
    }

    pub(crate) fn write_constructor(&mut self, ctor: &ConstructorDescriptor) {
        match self.stream().write_cache().constructor_index(ctor) {
            Some(index) => {
                self.out.write_u16(descriptor_tag::INDEX);
                self.out.write_u32(index);
            }
            None => {
                self.out.write_u16(descriptor_tag::DETAILS);
                write_constructor_details(&mut self.out, ctor);
            }
        }
    }

    pub(crate) fn write_field(&mut self, field: &FieldDescriptor) {
        match self.stream().write_cache().field_index(field) {
            Some(index) => {
                self.out.write_u16(descriptor_tag::INDEX);
                self.out.write_u32(index);
            }
            None => {
                self.out.write_u16(descriptor_tag::DETAILS);
                write_field_details(&mut self.out, field);
            }
        }
    }

    pub(crate) fn write_context(&mut self, ctx: Option<&ContextId>) {
        let Some(ctx) = ctx else {
            self.out.write_u16(descriptor_tag::CONTEXT_NULL);
            return;
        };
        match self.stream().write_cache().context_index(ctx) {
            Some(index) => {
                self.out.write_u16(descriptor_tag::INDEX);
                self.out.write_u32(index);
            }
            None => {
                self.out.write_u16(descriptor_tag::DETAILS);
                self.out.write_str(ctx.as_str());
            }
        }
    }

    /// Writes call arguments, each with the kind `kind_of` returns for its
    /// position.
    pub(crate) fn write_args<'k>(
        &mut self,
        args: &[Value],
        kind_of: impl Fn(usize) -> &'k WriterKind,
    ) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            self.write_value(arg, kind_of(i))?;
        }
        Ok(())
    }

    pub(crate) fn write_value(&mut self, value: &Value, kind: &WriterKind) -> Result<()> {
        if let WriterKind::Selector(select) = kind {
            let chosen = select(value);
            if matches!(chosen, WriterKind::Selector(_)) {
                return Err(PeerlinkError::TransferFailure(
                    "Writer selector chose another selector".to_string(),
                ));
            }
            return self.write_value(value, &chosen);
        }

        let out = &mut self.out;
        match value {
            Value::Null => out.write_u16(tag::NULL),
            Value::Bool(v) => {
                out.write_u16(tag::BOOLEAN);
                out.write_bool(*v);
            }
            Value::Byte(v) => {
                out.write_u16(tag::BYTE);
                out.write_i8(*v);
            }
            Value::Short(v) => {
                out.write_u16(tag::SHORT);
                out.write_i16(*v);
            }
            Value::Int(v) => {
                out.write_u16(tag::INT);
                out.write_i32(*v);
            }
            Value::Long(v) => {
                out.write_u16(tag::LONG);
                out.write_i64(*v);
            }
            Value::Char(v) => {
                out.write_u16(tag::CHAR);
                out.write_char(*v);
            }
            Value::Float(v) => {
                out.write_u16(tag::FLOAT);
                out.write_f32(*v);
            }
            Value::Double(v) => {
                out.write_u16(tag::DOUBLE);
                out.write_f64(*v);
            }
            Value::String(v) => {
                out.write_u16(tag::STRING);
                out.write_str(v);
            }
            Value::BoolArray(v) => {
                out.write_u16(tag::ARRAY_BOOLEAN);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_bool(*x));
            }
            Value::ByteArray(v) => {
                out.write_u16(tag::ARRAY_BYTE);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_i8(*x));
            }
            Value::ShortArray(v) => {
                out.write_u16(tag::ARRAY_SHORT);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_i16(*x));
            }
            Value::IntArray(v) => {
                out.write_u16(tag::ARRAY_INT);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_i32(*x));
            }
            Value::LongArray(v) => {
                out.write_u16(tag::ARRAY_LONG);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_i64(*x));
            }
            Value::FloatArray(v) => {
                out.write_u16(tag::ARRAY_FLOAT);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_f32(*x));
            }
            Value::DoubleArray(v) => {
                out.write_u16(tag::ARRAY_DOUBLE);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_f64(*x));
            }
            Value::CharArray(v) => {
                out.write_u16(tag::ARRAY_CHAR);
                out.write_u32(v.len() as u32);
                v.iter().for_each(|x| out.write_char(*x));
            }
            Value::Array {
                component,
                elements,
            } => {
                out.write_u16(tag::ARRAY);
                self.write_type(component);
                self.out.write_u32(elements.len() as u32);
                let element_kind = kind.component();
                for element in elements {
                    self.write_value(element, &element_kind)?;
                }
            }
            Value::Enum { ty, constant } => {
                out.write_u16(tag::ENUM);
                self.write_type(ty);
                self.out.write_str(constant);
            }
            Value::Object(obj) => self.write_object(obj, kind)?,
            Value::Serialized(serialized) => {
                out.write_u16(tag::SERIALIZED);
                self.write_type(serialized.type_descriptor());
                self.out.write_bytes(serialized.payload());
            }
            Value::Type(ty) => {
                out.write_u16(tag::CLASS);
                self.write_type(ty);
            }
            Value::Method(method) => {
                out.write_u16(tag::METHOD);
                self.write_method(method);
            }
            Value::Constructor(ctor) => {
                out.write_u16(tag::CONSTRUCTOR);
                self.write_constructor(ctor);
            }
            Value::Field(field) => {
                out.write_u16(tag::FIELD);
                self.write_field(field);
            }
            Value::Context(ctx) => {
                out.write_u16(tag::CLASSLOADER);
                self.write_context(ctx.as_ref());
            }
        }
        Ok(())
    }

    fn write_object(&mut self, obj: &ObjectRef, kind: &WriterKind) -> Result<()> {
        // A proxy of this very scope goes back as the peer's own id.
        if let Some(proxy) = obj.as_proxy() {
            if Arc::ptr_eq(proxy.scope(), self.scope) {
                self.out.write_u16(tag::REMOTE);
                self.out.write_u32(proxy.remote_id());
                return Ok(());
            }
        }
        if kind.is_default() {
            let by_type = self.properties().type_writer(&obj.type_descriptor());
            self.write_object_as(obj, by_type)
        } else {
            self.write_object_as(obj, kind)
        }
    }

    fn write_object_as(&mut self, obj: &ObjectRef, kind: &WriterKind) -> Result<()> {
        match kind {
            WriterKind::Selector(select) => {
                let chosen = select(&Value::Object(obj.clone()));
                if matches!(chosen, WriterKind::Selector(_)) {
                    return Err(PeerlinkError::TransferFailure(
                        "Writer selector chose another selector".to_string(),
                    ));
                }
                self.write_object_as(obj, &chosen)
            }
            WriterKind::Default | WriterKind::ArrayComponent(_) => match obj.enum_constant() {
                Some(constant) => self.write_enum(obj, &constant),
                None => self.write_new_remote(obj, false),
            },
            WriterKind::Remote => self.write_new_remote(obj, false),
            WriterKind::RemoteOnly => self.write_new_remote(obj, true),
            WriterKind::Enum => {
                let constant = obj.enum_constant().ok_or_else(|| {
                    PeerlinkError::TransferFailure(format!(
                        "Not an enum constant: {}",
                        obj.type_descriptor()
                    ))
                })?;
                self.write_enum(obj, &constant)
            }
            WriterKind::SelfSerialize => {
                let payload = obj.write_external().ok_or_else(|| {
                    PeerlinkError::TransferFailure(format!(
                        "Object does not serialize itself: {}",
                        obj.type_descriptor()
                    ))
                })?;
                self.out.write_u16(tag::EXTERNALIZABLE);
                self.write_type(&obj.type_descriptor());
                self.out.write_bytes(&payload);
                Ok(())
            }
            WriterKind::Serialize => {
                let serialized = obj.serialized().ok_or_else(|| {
                    PeerlinkError::TransferFailure(format!(
                        "Object is not serializable: {}",
                        obj.type_descriptor()
                    ))
                })?;
                self.out.write_u16(tag::SERIALIZED);
                self.write_type(serialized.type_descriptor());
                self.out.write_bytes(serialized.payload());
                Ok(())
            }
            WriterKind::Wrapper(helper) => {
                let reduced = self.registry().wrapper(helper)?.reduce(obj)?;
                self.out.write_u16(tag::WRAPPER);
                self.write_type(helper);
                self.write_value(&reduced, &WriterKind::Default)
            }
        }
    }

    fn write_enum(&mut self, obj: &ObjectRef, constant: &str) -> Result<()> {
        self.out.write_u16(tag::ENUM);
        self.write_type(&obj.type_descriptor());
        self.out.write_str(constant);
        Ok(())
    }

    fn write_new_remote(&mut self, obj: &ObjectRef, require_interfaces: bool) -> Result<()> {
        let interfaces = self.registry().reduce_interfaces(&obj.interfaces());
        if require_interfaces && interfaces.is_empty() {
            return Err(PeerlinkError::TransferFailure(format!(
                "Object has no remote interfaces: {}",
                obj.type_descriptor()
            )));
        }
        let id = self.expose(obj)?;
        self.out.write_u16(tag::NEW_REMOTE);
        self.out.write_u32(id);
        self.write_interfaces(&interfaces)
    }

    /// Exposes `obj` in the scope; undone if the block fails.
    pub(crate) fn expose(&mut self, obj: &ObjectRef) -> Result<u32> {
        let id = self.scope.expose_local_object(obj)?;
        self.exposed.push(id);
        Ok(id)
    }

    /// Writes an interface set, reduced to its minimal form.
    pub(crate) fn write_interfaces(&mut self, interfaces: &[TypeDescriptor]) -> Result<()> {
        let count = u16::try_from(interfaces.len()).map_err(|_| {
            PeerlinkError::TransferFailure(format!(
                "Too many remote interfaces: {}",
                interfaces.len()
            ))
        })?;
        self.out.write_u16(count);
        for ty in interfaces {
            self.write_type(ty);
        }
        Ok(())
    }
}

/// Reads values of one received block.
///
/// Descriptors that arrive in full get a read index; the announcements are
/// sent to the peer when the reader is dropped.
pub(crate) struct ValueReader<'a, 'b> {
    input: WireReader<'b>,
    connection: &'a Connection,
    stream: &'a Stream,
    scope: Option<Arc<Scope>>,
    announcements: Vec<WireWriter>,
}

impl<'a, 'b> ValueReader<'a, 'b> {
    pub(crate) fn new(connection: &'a Connection, stream: &'a Stream, input: WireReader<'b>) -> Self {
        Self {
            input,
            connection,
            stream,
            scope: None,
            announcements: Vec::new(),
        }
    }

    pub(crate) fn wire(&mut self) -> &mut WireReader<'b> {
        &mut self.input
    }

    /// Sets the scope remote references are resolved in.
    pub(crate) fn set_scope(&mut self, scope: Option<Arc<Scope>>) {
        self.scope = scope;
    }

    fn registry(&self) -> &'a TypeRegistry {
        let connection: &'a Connection = self.connection;
        &connection.options().registry
    }

    fn scope(&self) -> Result<&Arc<Scope>> {
        self.scope.as_ref().ok_or_else(|| {
            PeerlinkError::TransferFailure("Remote reference outside of a scope".to_string())
        })
    }

    fn announce(&mut self, announcement: Option<WireWriter>) {
        if let Some(announcement) = announcement {
            self.announcements.push(announcement);
        }
    }

    fn bad_descriptor_tag(kind: &str, tag: u16) -> PeerlinkError {
        PeerlinkError::Protocol(format!("Invalid {} descriptor tag: {}", kind, tag))
    }

    pub(crate) fn read_type(&mut self) -> Result<TypeDescriptor> {
        match self.input.read_u16()? {
            descriptor_tag::DETAILS => {
                let ty = read_type_details(&mut self.input)?;
                self.registry().resolve_type(&ty)?;
                let announcement = self.stream.read_cache().put_type(&ty);
                self.announce(announcement);
                Ok(ty)
            }
            descriptor_tag::INDEX => {
                let index = self.input.read_u32()?;
                self.stream.read_cache().type_at(index)
            }
            other => Err(Self::bad_descriptor_tag("type", other)),
        }
    }

    pub(crate) fn read_method(&mut self) -> Result<MethodDescriptor> {
        match self.input.read_u16()? {
            descriptor_tag::DETAILS => {
                let method = read_method_details(&mut self.input)?;
                self.registry().resolve_type(method.declaring())?;
                let announcement = self.stream.read_cache().put_method(&method);
                self.announce(announcement);
                Ok(method)
            }
            descriptor_tag::INDEX => {
                let index = self.input.read_u32()?;
                self.stream.read_cache().method_at(index)
            }
            other => Err(Self::bad_descriptor_tag("method", other)),
        }
    }

    pub(crate) fn read_constructor(&mut self) -> Result<ConstructorDescriptor> {
        match self.input.read_u16()? {
            descriptor_tag::DETAILS => {
                let ctor = read_constructor_details(&mut self.input)?;
                self.registry().resolve_type(ctor.declaring())?;
                let announcement = self.stream.read_cache().put_constructor(&ctor);
                self.announce(announcement);
                Ok(ctor)
            }
            descriptor_tag::INDEX => {
                let index = self.input.read_u32()?;
                self.stream.read_cache().constructor_at(index)
            }
            other => Err(Self::bad_descriptor_tag("constructor", other)),
        }
    }

    pub(crate) fn read_field(&mut self) -> Result<FieldDescriptor> {
        match self.input.read_u16()? {
            descriptor_tag::DETAILS => {
                let field = read_field_details(&mut self.input)?;
                self.registry().resolve_type(field.declaring())?;
                let announcement = self.stream.read_cache().put_field(&field);
                self.announce(announcement);
                Ok(field)
            }
            descriptor_tag::INDEX => {
                let index = self.input.read_u32()?;
                self.stream.read_cache().field_at(index)
            }
            other => Err(Self::bad_descriptor_tag("field", other)),
        }
    }

    pub(crate) fn read_context(&mut self) -> Result<Option<ContextId>> {
        match self.input.read_u16()? {
            descriptor_tag::CONTEXT_NULL => Ok(None),
            descriptor_tag::DETAILS => {
                let ctx = ContextId::new(self.input.read_str()?);
                self.registry().context(Some(&ctx))?;
                let announcement = self.stream.read_cache().put_context(&ctx);
                self.announce(announcement);
                Ok(Some(ctx))
            }
            descriptor_tag::INDEX => {
                let index = self.input.read_u32()?;
                self.stream.read_cache().context_at(index).map(Some)
            }
            other => Err(Self::bad_descriptor_tag("context", other)),
        }
    }

    /// Reads the interface set of a new remote reference.
    ///
    /// Interfaces this side cannot resolve are left out of the proxy and
    /// recorded as inaccessible; the rest of the set is still read.
    pub(crate) fn read_interfaces(&mut self) -> Result<Vec<TypeDescriptor>> {
        let n = self.input.read_u16()? as usize;
        let mut interfaces = Vec::with_capacity(n.min(self.input.remaining()));
        for _ in 0..n {
            let ty = match self.input.read_u16()? {
                descriptor_tag::DETAILS => read_type_details(&mut self.input)?,
                descriptor_tag::INDEX => {
                    let index = self.input.read_u32()?;
                    match self.stream.read_cache().type_at(index) {
                        Ok(ty) => interfaces.push(ty),
                        Err(e) => self.inaccessible_interface(&format!("#{}", index), &e),
                    }
                    continue;
                }
                other => return Err(Self::bad_descriptor_tag("type", other)),
            };
            match self.registry().resolve_type(&ty) {
                Ok(()) => {
                    let announcement = self.stream.read_cache().put_type(&ty);
                    self.announce(announcement);
                    interfaces.push(ty);
                }
                Err(e) => self.inaccessible_interface(ty.name(), &e),
            }
        }
        Ok(interfaces)
    }

    fn inaccessible_interface(&self, name: &str, error: &PeerlinkError) {
        debug!(interface = name, error = %error, "Skipping inaccessible interface");
        if let Some(statistics) = self.connection.statistics() {
            statistics.record_inaccessible_interface(name);
        }
    }

    pub(crate) fn read_args(&mut self, count: usize) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(count.min(self.input.remaining()));
        for _ in 0..count {
            args.push(self.read_value()?);
        }
        Ok(args)
    }

    pub(crate) fn read_value(&mut self) -> Result<Value> {
        let input = &mut self.input;
        let value = match input.read_u16()? {
            tag::NULL => Value::Null,
            tag::BOOLEAN => Value::Bool(input.read_bool()?),
            tag::BYTE => Value::Byte(input.read_i8()?),
            tag::SHORT => Value::Short(input.read_i16()?),
            tag::INT => Value::Int(input.read_i32()?),
            tag::LONG => Value::Long(input.read_i64()?),
            tag::CHAR => Value::Char(input.read_char()?),
            tag::FLOAT => Value::Float(input.read_f32()?),
            tag::DOUBLE => Value::Double(input.read_f64()?),
            tag::STRING => Value::String(input.read_str()?),
            tag::ARRAY_BOOLEAN => {
                let n = input.read_len(1)?;
                Value::BoolArray((0..n).map(|_| input.read_bool()).collect::<Result<_>>()?)
            }
            tag::ARRAY_BYTE => {
                let n = input.read_len(1)?;
                Value::ByteArray((0..n).map(|_| input.read_i8()).collect::<Result<_>>()?)
            }
            tag::ARRAY_SHORT => {
                let n = input.read_len(2)?;
                Value::ShortArray((0..n).map(|_| input.read_i16()).collect::<Result<_>>()?)
            }
            tag::ARRAY_INT => {
                let n = input.read_len(4)?;
                Value::IntArray((0..n).map(|_| input.read_i32()).collect::<Result<_>>()?)
            }
            tag::ARRAY_LONG => {
                let n = input.read_len(8)?;
                Value::LongArray((0..n).map(|_| input.read_i64()).collect::<Result<_>>()?)
            }
            tag::ARRAY_FLOAT => {
                let n = input.read_len(4)?;
                Value::FloatArray((0..n).map(|_| input.read_f32()).collect::<Result<_>>()?)
            }
            tag::ARRAY_DOUBLE => {
                let n = input.read_len(8)?;
                Value::DoubleArray((0..n).map(|_| input.read_f64()).collect::<Result<_>>()?)
            }
            tag::ARRAY_CHAR => {
                let n = input.read_len(4)?;
                Value::CharArray((0..n).map(|_| input.read_char()).collect::<Result<_>>()?)
            }
            tag::ARRAY => {
                let component = self.read_type()?;
                let n = self.input.read_len(2)?;
                let mut elements = Vec::with_capacity(n);
                for _ in 0..n {
                    elements.push(self.read_value()?);
                }
                Value::Array {
                    component,
                    elements,
                }
            }
            tag::ENUM => {
                let ty = self.read_type()?;
                let constant = self.input.read_str()?;
                Value::Enum { ty, constant }
            }
            tag::REMOTE => {
                let id = input.read_u32()?;
                let obj = self.scope()?.local_object(id).ok_or_else(|| {
                    PeerlinkError::TransferFailure(format!("Object not found for id: {}", id))
                })?;
                Value::Object(obj)
            }
            tag::NEW_REMOTE => {
                let id = input.read_u32()?;
                let interfaces = self.read_interfaces()?;
                Value::Object(self.scope()?.proxy_for(id, interfaces))
            }
            tag::EXTERNALIZABLE => {
                let ty = self.read_type()?;
                let payload = self.input.read_bytes()?;
                let read = self.registry().external_reader(&ty)?;
                read(&ty, payload)?
            }
            tag::SERIALIZED => {
                let ty = self.read_type()?;
                let payload = self.input.read_bytes()?;
                Value::Serialized(SerializedValue::new(ty, payload.to_vec()))
            }
            tag::WRAPPER => {
                let helper = self.read_type()?;
                let reduced = self.read_value()?;
                self.registry().wrapper(&helper)?.reconstruct(reduced)?
            }
            tag::CLASS => Value::Type(self.read_type()?),
            tag::METHOD => Value::Method(self.read_method()?),
            tag::CONSTRUCTOR => Value::Constructor(self.read_constructor()?),
            tag::FIELD => Value::Field(self.read_field()?),
            tag::CLASSLOADER => Value::Context(self.read_context()?),
            other => {
                return Err(PeerlinkError::Protocol(format!("Unknown value tag: {}", other)));
            }
        };
        Ok(value)
    }
}

impl Drop for ValueReader<'_, '_> {
    fn drop(&mut self) {
        for announcement in self.announcements.drain(..) {
            if let Err(e) = self.stream.send(announcement.as_slice()) {
                warn!(stream = self.stream.serial(), error = %e, "Failed to announce cache index");
                break;
            }
        }
    }
}
