//! Per-stream descriptor caches.
//!
//! Each stream keeps two independent maps per descriptor kind. The read
//! side assigns an index the first time a descriptor arrives in full and
//! announces it to the peer; the write side learns indexes only from those
//! announcements and then sends the index instead of the full descriptor.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::{Mutex, RwLock};
use peerlink_common::transport::{WireReader, WireWriter};
use peerlink_common::{
    descriptor_tag, Command, ConstructorDescriptor, ContextId, FieldDescriptor, MethodDescriptor,
    PeerlinkError, Result, TypeDescriptor,
};

/// Descriptor kinds that have a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheKind {
    Type,
    Method,
    Constructor,
    Context,
    Field,
}

impl CacheKind {
    /// Command that announces a read index of this kind.
    pub(crate) fn announcement(self) -> Command {
        match self {
            CacheKind::Type => Command::CachedClass,
            CacheKind::Method => Command::CachedMethod,
            CacheKind::Constructor => Command::CachedConstructor,
            CacheKind::Context => Command::CachedClassLoader,
            CacheKind::Field => Command::CachedField,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CacheKind::Type => "Class",
            CacheKind::Method => "Method",
            CacheKind::Constructor => "Constructor",
            CacheKind::Context => "Class loader",
            CacheKind::Field => "Field",
        }
    }
}

/// Context id as stored in a cache. The default context is not cached.
pub(crate) type ContextKey = ContextId;

struct IndexMap<K> {
    by_value: HashMap<K, u32>,
    by_index: HashMap<u32, K>,
    next_index: u32,
}

impl<K: Clone + Eq + Hash> IndexMap<K> {
    fn new() -> Self {
        Self {
            by_value: HashMap::new(),
            by_index: HashMap::new(),
            next_index: 0,
        }
    }

    /// Returns the index of `value`, assigning the next one if absent.
    /// The flag is `true` if the index is new.
    fn put_if_absent(&mut self, value: &K) -> (u32, bool) {
        if let Some(index) = self.by_value.get(value) {
            return (*index, false);
        }
        let index = self.next_index;
        self.next_index += 1;
        self.by_value.insert(value.clone(), index);
        self.by_index.insert(index, value.clone());
        (index, true)
    }
}

/// Indexes the peer assigned to descriptors this side writes.
#[derive(Default)]
pub(crate) struct WriteCache {
    types: RwLock<HashMap<TypeDescriptor, u32>>,
    methods: RwLock<HashMap<MethodDescriptor, u32>>,
    constructors: RwLock<HashMap<ConstructorDescriptor, u32>>,
    contexts: RwLock<HashMap<ContextKey, u32>>,
    fields: RwLock<HashMap<FieldDescriptor, u32>>,
}

impl WriteCache {
    pub(crate) fn type_index(&self, ty: &TypeDescriptor) -> Option<u32> {
        self.types.read().get(ty).copied()
    }

    pub(crate) fn method_index(&self, method: &MethodDescriptor) -> Option<u32> {
        self.methods.read().get(method).copied()
    }

    pub(crate) fn constructor_index(&self, ctor: &ConstructorDescriptor) -> Option<u32> {
        self.constructors.read().get(ctor).copied()
    }

    pub(crate) fn context_index(&self, ctx: &ContextKey) -> Option<u32> {
        self.contexts.read().get(ctx).copied()
    }

    pub(crate) fn field_index(&self, field: &FieldDescriptor) -> Option<u32> {
        self.fields.read().get(field).copied()
    }

    /// Applies a cache announcement received from the peer.
    pub(crate) fn apply_announcement(&self, kind: CacheKind, input: &mut WireReader<'_>) -> Result<()> {
        match kind {
            CacheKind::Type => {
                let ty = read_type_details(input)?;
                let index = input.read_u32()?;
                self.types.write().insert(ty, index);
            }
            CacheKind::Method => {
                let method = read_method_details(input)?;
                let index = input.read_u32()?;
                self.methods.write().insert(method, index);
            }
            CacheKind::Constructor => {
                let ctor = read_constructor_details(input)?;
                let index = input.read_u32()?;
                self.constructors.write().insert(ctor, index);
            }
            CacheKind::Context => {
                let ctx = input.read_str()?;
                let index = input.read_u32()?;
                self.contexts.write().insert(ContextId::new(ctx), index);
            }
            CacheKind::Field => {
                let field = read_field_details(input)?;
                let index = input.read_u32()?;
                self.fields.write().insert(field, index);
            }
        }
        Ok(())
    }
}

/// Indexes this side assigned to descriptors the peer writes.
pub(crate) struct ReadCache {
    types: Mutex<IndexMap<TypeDescriptor>>,
    methods: Mutex<IndexMap<MethodDescriptor>>,
    constructors: Mutex<IndexMap<ConstructorDescriptor>>,
    contexts: Mutex<IndexMap<ContextKey>>,
    fields: Mutex<IndexMap<FieldDescriptor>>,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self {
            types: Mutex::new(IndexMap::new()),
            methods: Mutex::new(IndexMap::new()),
            constructors: Mutex::new(IndexMap::new()),
            contexts: Mutex::new(IndexMap::new()),
            fields: Mutex::new(IndexMap::new()),
        }
    }
}

fn not_found(kind: CacheKind, index: u32) -> PeerlinkError {
    PeerlinkError::TransferFailure(format!("{} not found for index: {}", kind.label(), index))
}

impl ReadCache {
    pub(crate) fn type_at(&self, index: u32) -> Result<TypeDescriptor> {
        self.types
            .lock()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| not_found(CacheKind::Type, index))
    }

    pub(crate) fn method_at(&self, index: u32) -> Result<MethodDescriptor> {
        self.methods
            .lock()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| not_found(CacheKind::Method, index))
    }

    pub(crate) fn constructor_at(&self, index: u32) -> Result<ConstructorDescriptor> {
        self.constructors
            .lock()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| not_found(CacheKind::Constructor, index))
    }

    pub(crate) fn context_at(&self, index: u32) -> Result<ContextKey> {
        self.contexts
            .lock()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| not_found(CacheKind::Context, index))
    }

    pub(crate) fn field_at(&self, index: u32) -> Result<FieldDescriptor> {
        self.fields
            .lock()
            .by_index
            .get(&index)
            .cloned()
            .ok_or_else(|| not_found(CacheKind::Field, index))
    }

    /// Assigns a read index to a descriptor that arrived in full.
    ///
    /// Returns the announcement to send if the index is new.
    pub(crate) fn put_type(&self, ty: &TypeDescriptor) -> Option<WireWriter> {
        let (index, fresh) = self.types.lock().put_if_absent(ty);
        fresh.then(|| announce(CacheKind::Type, index, |w| write_type_details(w, ty)))
    }

    pub(crate) fn put_method(&self, method: &MethodDescriptor) -> Option<WireWriter> {
        let (index, fresh) = self.methods.lock().put_if_absent(method);
        fresh.then(|| announce(CacheKind::Method, index, |w| write_method_details(w, method)))
    }

    pub(crate) fn put_constructor(&self, ctor: &ConstructorDescriptor) -> Option<WireWriter> {
        let (index, fresh) = self.constructors.lock().put_if_absent(ctor);
        fresh.then(|| {
            announce(CacheKind::Constructor, index, |w| {
                write_constructor_details(w, ctor)
            })
        })
    }

    pub(crate) fn put_context(&self, ctx: &ContextKey) -> Option<WireWriter> {
        let (index, fresh) = self.contexts.lock().put_if_absent(ctx);
        fresh.then(|| announce(CacheKind::Context, index, |w| w.write_str(ctx.as_str())))
    }

    pub(crate) fn put_field(&self, field: &FieldDescriptor) -> Option<WireWriter> {
        let (index, fresh) = self.fields.lock().put_if_absent(field);
        fresh.then(|| announce(CacheKind::Field, index, |w| write_field_details(w, field)))
    }
}

fn announce(kind: CacheKind, index: u32, details: impl FnOnce(&mut WireWriter)) -> WireWriter {
    let mut w = WireWriter::new();
    w.write_u16(kind.announcement().code());
    details(&mut w);
    w.write_u32(index);
    w
}

// Inline descriptor details. Nested descriptors (declaring types, parameter
// types, contexts inside types) are always written inline.

pub(crate) fn write_context_inline(w: &mut WireWriter, ctx: Option<&ContextId>) {
    match ctx {
        Some(ctx) => {
            w.write_u16(descriptor_tag::DETAILS);
            w.write_str(ctx.as_str());
        }
        None => w.write_u16(descriptor_tag::CONTEXT_NULL),
    }
}

pub(crate) fn read_context_inline(r: &mut WireReader<'_>) -> Result<Option<ContextId>> {
    match r.read_u16()? {
        descriptor_tag::DETAILS => Ok(Some(ContextId::new(r.read_str()?))),
        descriptor_tag::CONTEXT_NULL => Ok(None),
        other => Err(PeerlinkError::Protocol(format!(
            "Invalid inline context tag: {}",
            other
        ))),
    }
}

pub(crate) fn write_type_details(w: &mut WireWriter, ty: &TypeDescriptor) {
    w.write_str(ty.name());
    write_context_inline(w, ty.context());
}

pub(crate) fn read_type_details(r: &mut WireReader<'_>) -> Result<TypeDescriptor> {
    let name = r.read_str()?;
    let ctx = read_context_inline(r)?;
    Ok(TypeDescriptor::with_context(name, ctx))
}

fn write_type_list(w: &mut WireWriter, types: &[TypeDescriptor]) {
    w.write_u16(types.len() as u16);
    for ty in types {
        write_type_details(w, ty);
    }
}

fn read_type_list(r: &mut WireReader<'_>) -> Result<Vec<TypeDescriptor>> {
    let n = r.read_u16()? as usize;
    let mut types = Vec::with_capacity(n.min(r.remaining()));
    for _ in 0..n {
        types.push(read_type_details(r)?);
    }
    Ok(types)
}

pub(crate) fn write_method_details(w: &mut WireWriter, method: &MethodDescriptor) {
    write_type_details(w, method.declaring());
    w.write_str(method.name());
    write_type_list(w, method.params());
}

pub(crate) fn read_method_details(r: &mut WireReader<'_>) -> Result<MethodDescriptor> {
    let declaring = read_type_details(r)?;
    let name = r.read_str()?;
    let params = read_type_list(r)?;
    Ok(MethodDescriptor::new(declaring, name, params))
}

pub(crate) fn write_constructor_details(w: &mut WireWriter, ctor: &ConstructorDescriptor) {
    write_type_details(w, ctor.declaring());
    write_type_list(w, ctor.params());
}

pub(crate) fn read_constructor_details(r: &mut WireReader<'_>) -> Result<ConstructorDescriptor> {
    let declaring = read_type_details(r)?;
    let params = read_type_list(r)?;
    Ok(ConstructorDescriptor::new(declaring, params))
}

pub(crate) fn write_field_details(w: &mut WireWriter, field: &FieldDescriptor) {
    write_type_details(w, field.declaring());
    w.write_str(field.name());
}

pub(crate) fn read_field_details(r: &mut WireReader<'_>) -> Result<FieldDescriptor> {
    let declaring = read_type_details(r)?;
    let name = r.read_str()?;
    Ok(FieldDescriptor::new(declaring, name))
}
