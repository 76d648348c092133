use rustc_hash::FxHashMap;
use std::rc::Rc;

use umbra_heap::{BackingAllocator, NativeAddr, SystemAllocator, UnmanagedHeap};
use umbra_layout::{
    BlittabilityOracle, ShadowField, ShadowLayout, ShadowStore, ShadowSynthesizer, SynthOptions,
};
use umbra_schema::{PrimKind, SchemaRegistry, TypeId, TypeKind};

use crate::value::{ArrayRef, ArrayValue, ObjRef, RecordValue, Value};
use crate::CopyError;

/// Per-operation table of host objects already copied out, keyed by
/// `Rc` pointer identity. Created fresh for every top-level call.
#[derive(Default)]
struct CopyContext {
    visited: FxHashMap<usize, NativeAddr>,
}

/// Per-operation table of buffers already decoded, keyed by address.
/// Maps back to the shared instance so aliasing reconstructs as one
/// object.
#[derive(Default)]
struct DecodeContext {
    visited: FxHashMap<NativeAddr, Value>,
}

/// Bidirectional deep copy between host value graphs and flat shadow
/// buffers.
///
/// The engine consults the synthesizer (through the shared
/// [`ShadowStore`]) for field shapes and the heap for every
/// out-of-line buffer. Aliasing and cycles are preserved through the
/// per-operation visited tables.
pub struct GraphCopier<'a, A: BackingAllocator = SystemAllocator> {
    pub(crate) schema: &'a SchemaRegistry,
    pub(crate) shadows: &'a mut ShadowStore,
    pub(crate) heap: &'a mut UnmanagedHeap<A>,
    oracle: BlittabilityOracle,
}

impl<'a, A: BackingAllocator> GraphCopier<'a, A> {
    pub fn new(
        schema: &'a SchemaRegistry,
        shadows: &'a mut ShadowStore,
        heap: &'a mut UnmanagedHeap<A>,
    ) -> Self {
        GraphCopier {
            schema,
            shadows,
            heap,
            oracle: BlittabilityOracle::new(),
        }
    }

    pub fn heap(&self) -> &UnmanagedHeap<A> {
        self.heap
    }

    /// Copies a host value graph into freshly allocated flat buffers
    /// and returns the root address. The caller owns the returned
    /// address and every buffer transitively beneath it.
    pub fn to_native(&mut self, value: &Value) -> Result<NativeAddr, CopyError> {
        let mut ctx = CopyContext::default();
        match value {
            Value::Object(None) | Value::Array(None) => Ok(NativeAddr::NULL),
            Value::Object(Some(object)) => self.copy_object(&mut ctx, object),
            Value::Array(Some(array)) => self.copy_array(&mut ctx, array),
            other => {
                let ty = self.value_type(other)?;
                let shadow = self.shadow_of(ty)?;
                let size = self.shadow_size(shadow)?;
                let addr = self.heap.allocate(size)?;
                self.write_slot(&mut ctx, other, ty, addr, 0)?;
                log::debug!("copied root {} value to {addr}", other.kind_name());
                Ok(addr)
            }
        }
    }

    /// Reconstructs a host value graph from a flat buffer tree. The
    /// exact inverse of [`GraphCopier::to_native`].
    pub fn from_native(&mut self, addr: NativeAddr, ty: TypeId) -> Result<Value, CopyError> {
        let mut ctx = DecodeContext::default();
        match self.kind_of(ty)? {
            TypeKind::Primitive(prim) => {
                if addr.is_null() {
                    return Err(CopyError::Other(
                        "null address for a primitive root".to_string(),
                    ));
                }
                self.read_primitive(prim, addr, 0)
            }
            TypeKind::ValueRecord => {
                if addr.is_null() {
                    return Err(CopyError::Other(
                        "null address for a value-record root".to_string(),
                    ));
                }
                Ok(Value::Struct(self.read_record(&mut ctx, ty, addr, 0)?))
            }
            TypeKind::RefRecord => {
                if addr.is_null() {
                    return Ok(Value::null_object());
                }
                self.decode_object(&mut ctx, addr, ty)
            }
            TypeKind::Array => {
                if addr.is_null() {
                    return Ok(Value::null_array());
                }
                self.decode_array(&mut ctx, addr, ty)
            }
        }
    }

    // --- outbound -------------------------------------------------------

    /// Copies a reference aggregate, allocating its shadow buffer and
    /// registering the address *before* recursing into fields, which is
    /// what lets reference-kind self-reference terminate.
    fn copy_object(&mut self, ctx: &mut CopyContext, object: &ObjRef) -> Result<NativeAddr, CopyError> {
        let identity = Rc::as_ptr(object) as usize;
        if let Some(&existing) = ctx.visited.get(&identity) {
            log::trace!("object already copied to {existing}");
            return Ok(existing);
        }
        let record = object.borrow();
        let shadow = self.shadow_of(record.ty)?;
        let size = self.shadow_size(shadow)?;
        let addr = self.heap.allocate(size)?;
        ctx.visited.insert(identity, addr);
        self.write_record_fields(ctx, &record, record.ty, addr, 0)?;
        Ok(addr)
    }

    /// Copies an array: a `{address, count}` header buffer plus a
    /// separately allocated element buffer.
    fn copy_array(&mut self, ctx: &mut CopyContext, array: &ArrayRef) -> Result<NativeAddr, CopyError> {
        let identity = Rc::as_ptr(array) as usize;
        if let Some(&existing) = ctx.visited.get(&identity) {
            log::trace!("array already copied to {existing}");
            return Ok(existing);
        }
        let array = array.borrow();
        let shadow = self.shadow_of(array.ty)?;
        let (stride, count_offset, header_size) = match self.shadows.get(shadow) {
            Some(ShadowLayout::Array {
                element_stride_bytes,
                count_offset,
                size_bytes,
                ..
            }) => (*element_stride_bytes, *count_offset, *size_bytes),
            _ => {
                return Err(CopyError::Other(format!(
                    "expected array shadow for `{}`",
                    self.type_label(array.ty)
                )))
            }
        };
        let element_ty = self
            .schema
            .element(array.ty)
            .ok_or_else(|| CopyError::UnknownType(self.type_label(array.ty)))?;

        let count = array.items.len();
        if count > i32::MAX as usize {
            return Err(CopyError::CountOverflow(count));
        }
        let data_bytes = count
            .checked_mul(stride)
            .ok_or(CopyError::CountOverflow(count))?;

        let header = self.heap.allocate(header_size)?;
        ctx.visited.insert(identity, header);
        let elements = self.heap.allocate(data_bytes)?;
        self.heap.write_word(header, 0, elements.raw())?;
        self.heap.write_i32(header, count_offset, count as i32)?;
        log::trace!("array of {count} elements at {header}, data at {elements}");

        match self.kind_of(element_ty)? {
            // Blittable scalars skip per-element kind dispatch.
            TypeKind::Primitive(prim) if self.oracle.is_blittable(self.schema, element_ty) => {
                for (i, item) in array.items.iter().enumerate() {
                    self.write_primitive(item, prim, elements, i * stride)?;
                }
            }
            _ => {
                for (i, item) in array.items.iter().enumerate() {
                    self.write_slot(ctx, item, element_ty, elements, i * stride)?;
                }
            }
        }
        Ok(header)
    }

    /// Writes every field of a record in shadow order, matching host
    /// values by field name first and by position only when the layouts
    /// have the same arity.
    fn write_record_fields(
        &mut self,
        ctx: &mut CopyContext,
        record: &RecordValue,
        ty: TypeId,
        addr: NativeAddr,
        base_offset: usize,
    ) -> Result<(), CopyError> {
        let shadow_fields = self.record_shadow_fields(ty)?;
        let host_fields = self.schema.chain_fields(ty)?;
        self.check_field_sets(ty, &shadow_fields, host_fields.len())?;

        for (i, shadow_field) in shadow_fields.iter().enumerate() {
            let host_field = &host_fields[i];
            if host_field.name.as_str() != &*shadow_field.name {
                return Err(self.field_mismatch(
                    ty,
                    format!(
                        "shadow field `{}` does not match declared field `{}`",
                        shadow_field.name, host_field.name
                    ),
                ));
            }
            let value = match record.field(&shadow_field.name) {
                Some(value) => value,
                None if record.fields.len() == shadow_fields.len() => {
                    log::warn!(
                        "field `{}` of `{}` matched by position",
                        shadow_field.name,
                        self.type_label(ty)
                    );
                    &record.fields[i].1
                }
                None => {
                    return Err(self.field_mismatch(
                        ty,
                        format!("host value has no field `{}`", shadow_field.name),
                    ))
                }
            };
            self.write_slot(
                ctx,
                value,
                host_field.ty,
                addr,
                base_offset + shadow_field.offset,
            )?;
        }
        Ok(())
    }

    /// Writes one slot: inline for primitives and value records, an
    /// address to a fresh out-of-line buffer for reference kinds.
    fn write_slot(
        &mut self,
        ctx: &mut CopyContext,
        value: &Value,
        declared_ty: TypeId,
        addr: NativeAddr,
        offset: usize,
    ) -> Result<(), CopyError> {
        match self.kind_of(declared_ty)? {
            TypeKind::Primitive(prim) => self.write_primitive(value, prim, addr, offset),
            TypeKind::ValueRecord => match value {
                Value::Struct(record) => {
                    self.write_record_fields(ctx, record, declared_ty, addr, offset)
                }
                other => Err(self.value_shape("struct", other)),
            },
            TypeKind::RefRecord => match value {
                Value::Object(None) => Ok(self.heap.write_word(addr, offset, 0)?),
                Value::Object(Some(object)) => {
                    let target = self.copy_object(ctx, object)?;
                    Ok(self.heap.write_word(addr, offset, target.raw())?)
                }
                other => Err(self.value_shape("object", other)),
            },
            TypeKind::Array => match value {
                Value::Array(None) => Ok(self.heap.write_word(addr, offset, 0)?),
                Value::Array(Some(array)) => {
                    let header = self.copy_array(ctx, array)?;
                    Ok(self.heap.write_word(addr, offset, header.raw())?)
                }
                other => Err(self.value_shape("array", other)),
            },
        }
    }

    /// Narrows or widens one scalar into its shadow slot. Bools shrink
    /// to one byte, chars to a u16 code unit, numerics pass through at
    /// native width and endianness.
    fn write_primitive(
        &mut self,
        value: &Value,
        prim: PrimKind,
        addr: NativeAddr,
        offset: usize,
    ) -> Result<(), CopyError> {
        match (prim, value) {
            (PrimKind::I8, Value::I8(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::U8, Value::U8(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::I16, Value::I16(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::U16, Value::U16(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::I32, Value::I32(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::U32, Value::U32(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::I64, Value::I64(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::U64, Value::U64(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::ISize, Value::ISize(v)) => {
                self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?
            }
            (PrimKind::USize, Value::USize(v)) => {
                self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?
            }
            (PrimKind::F32, Value::F32(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::F64, Value::F64(v)) => self.heap.write_bytes(addr, offset, &v.to_ne_bytes())?,
            (PrimKind::Bool, Value::Bool(v)) => {
                self.heap.write_bytes(addr, offset, &[u8::from(*v)])?
            }
            (PrimKind::Char, Value::Char(c)) => {
                let code = *c as u32;
                if code > u16::MAX as u32 {
                    return Err(CopyError::CharRange(code));
                }
                self.heap
                    .write_bytes(addr, offset, &(code as u16).to_ne_bytes())?
            }
            (expected, found) => return Err(self.value_shape(expected.name(), found)),
        }
        Ok(())
    }

    // --- inbound --------------------------------------------------------

    /// Decodes a reference aggregate. The shared instance is registered
    /// before field recursion so cycles resolve to the same object.
    fn decode_object(
        &mut self,
        ctx: &mut DecodeContext,
        addr: NativeAddr,
        ty: TypeId,
    ) -> Result<Value, CopyError> {
        if let Some(existing) = ctx.visited.get(&addr) {
            log::trace!("buffer {addr} already decoded");
            return Ok(existing.clone());
        }
        let object = Rc::new(std::cell::RefCell::new(RecordValue::new(ty)));
        ctx.visited
            .insert(addr, Value::Object(Some(object.clone())));
        let record = self.read_record(ctx, ty, addr, 0)?;
        *object.borrow_mut() = record;
        Ok(Value::Object(Some(object)))
    }

    /// Decodes an array from its `{address, count}` header.
    fn decode_array(
        &mut self,
        ctx: &mut DecodeContext,
        header: NativeAddr,
        ty: TypeId,
    ) -> Result<Value, CopyError> {
        if let Some(existing) = ctx.visited.get(&header) {
            log::trace!("array header {header} already decoded");
            return Ok(existing.clone());
        }
        let shadow = self.shadow_of(ty)?;
        let (stride, count_offset) = match self.shadows.get(shadow) {
            Some(ShadowLayout::Array {
                element_stride_bytes,
                count_offset,
                ..
            }) => (*element_stride_bytes, *count_offset),
            _ => {
                return Err(CopyError::Other(format!(
                    "expected array shadow for `{}`",
                    self.type_label(ty)
                )))
            }
        };
        let element_ty = self
            .schema
            .element(ty)
            .ok_or_else(|| CopyError::UnknownType(self.type_label(ty)))?;

        let elements = NativeAddr::from_raw(self.heap.read_word(header, 0)?);
        let count = self.heap.read_i32(header, count_offset)?;
        if count < 0 {
            return Err(CopyError::Other(format!(
                "array header at {header} holds negative count {count}"
            )));
        }
        let count = count as usize;

        let array = Rc::new(std::cell::RefCell::new(ArrayValue::new(
            ty,
            Vec::with_capacity(count),
        )));
        ctx.visited
            .insert(header, Value::Array(Some(array.clone())));
        for i in 0..count {
            let item = self.read_slot(ctx, element_ty, elements, i * stride)?;
            array.borrow_mut().items.push(item);
        }
        Ok(Value::Array(Some(array)))
    }

    /// Reads every field of a record back, assigning by field name.
    fn read_record(
        &mut self,
        ctx: &mut DecodeContext,
        ty: TypeId,
        addr: NativeAddr,
        base_offset: usize,
    ) -> Result<RecordValue, CopyError> {
        let shadow_fields = self.record_shadow_fields(ty)?;
        let host_fields = self.schema.chain_fields(ty)?;
        self.check_field_sets(ty, &shadow_fields, host_fields.len())?;

        let mut record = RecordValue::new(ty);
        for (i, shadow_field) in shadow_fields.iter().enumerate() {
            let host_field = &host_fields[i];
            if host_field.name.as_str() != &*shadow_field.name {
                return Err(self.field_mismatch(
                    ty,
                    format!(
                        "shadow field `{}` does not match declared field `{}`",
                        shadow_field.name, host_field.name
                    ),
                ));
            }
            let value = self.read_slot(
                ctx,
                host_field.ty,
                addr,
                base_offset + shadow_field.offset,
            )?;
            record.fields.push((host_field.name.clone(), value));
        }
        Ok(record)
    }

    /// Reads one slot: inline for primitives and value records,
    /// dereferencing the embedded address for reference kinds.
    fn read_slot(
        &mut self,
        ctx: &mut DecodeContext,
        declared_ty: TypeId,
        addr: NativeAddr,
        offset: usize,
    ) -> Result<Value, CopyError> {
        match self.kind_of(declared_ty)? {
            TypeKind::Primitive(prim) => self.read_primitive(prim, addr, offset),
            TypeKind::ValueRecord => Ok(Value::Struct(
                self.read_record(ctx, declared_ty, addr, offset)?,
            )),
            TypeKind::RefRecord => {
                let word = self.heap.read_word(addr, offset)?;
                if word == 0 {
                    Ok(Value::null_object())
                } else {
                    self.decode_object(ctx, NativeAddr::from_raw(word), declared_ty)
                }
            }
            TypeKind::Array => {
                let word = self.heap.read_word(addr, offset)?;
                if word == 0 {
                    Ok(Value::null_array())
                } else {
                    self.decode_array(ctx, NativeAddr::from_raw(word), declared_ty)
                }
            }
        }
    }

    fn read_primitive(
        &mut self,
        prim: PrimKind,
        addr: NativeAddr,
        offset: usize,
    ) -> Result<Value, CopyError> {
        macro_rules! read_ne {
            ($ty:ty) => {{
                let bytes = self.heap.read_bytes(addr, offset, std::mem::size_of::<$ty>())?;
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(buf)
            }};
        }
        Ok(match prim {
            PrimKind::I8 => Value::I8(read_ne!(i8)),
            PrimKind::U8 => Value::U8(read_ne!(u8)),
            PrimKind::I16 => Value::I16(read_ne!(i16)),
            PrimKind::U16 => Value::U16(read_ne!(u16)),
            PrimKind::I32 => Value::I32(read_ne!(i32)),
            PrimKind::U32 => Value::U32(read_ne!(u32)),
            PrimKind::I64 => Value::I64(read_ne!(i64)),
            PrimKind::U64 => Value::U64(read_ne!(u64)),
            PrimKind::ISize => Value::ISize(read_ne!(isize)),
            PrimKind::USize => Value::USize(read_ne!(usize)),
            PrimKind::F32 => Value::F32(read_ne!(f32)),
            PrimKind::F64 => Value::F64(read_ne!(f64)),
            PrimKind::Bool => Value::Bool(read_ne!(u8) != 0),
            PrimKind::Char => {
                let code = read_ne!(u16);
                match char::from_u32(code as u32) {
                    Some(c) => Value::Char(c),
                    None => return Err(CopyError::InvalidChar(code)),
                }
            }
        })
    }

    // --- shared helpers -------------------------------------------------

    /// Resolves (synthesizing on demand) the shadow for a host type.
    pub(crate) fn shadow_of(&mut self, ty: TypeId) -> Result<usize, CopyError> {
        let mut synthesizer = ShadowSynthesizer::new(self.schema, self.shadows);
        Ok(synthesizer.synthesize(ty, SynthOptions::flattened())?)
    }

    pub(crate) fn shadow_size(&self, shadow: usize) -> Result<usize, CopyError> {
        self.shadows
            .size_bytes(shadow)
            .ok_or_else(|| CopyError::Other(format!("missing shadow {shadow}")))
    }

    pub(crate) fn record_shadow_fields(
        &mut self,
        ty: TypeId,
    ) -> Result<Box<[ShadowField]>, CopyError> {
        let shadow = self.shadow_of(ty)?;
        match self.shadows.get(shadow) {
            Some(ShadowLayout::Record { fields, .. }) => Ok(fields.clone()),
            _ => Err(CopyError::Other(format!(
                "expected record shadow for `{}`",
                self.type_label(ty)
            ))),
        }
    }

    fn check_field_sets(
        &self,
        ty: TypeId,
        shadow_fields: &[ShadowField],
        host_count: usize,
    ) -> Result<(), CopyError> {
        if shadow_fields.len() != host_count {
            return Err(self.field_mismatch(
                ty,
                format!(
                    "shadow has {} fields, host type declares {}",
                    shadow_fields.len(),
                    host_count
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn kind_of(&self, ty: TypeId) -> Result<TypeKind, CopyError> {
        self.schema
            .kind(ty)
            .ok_or_else(|| CopyError::UnknownType(format!("{ty:?}")))
    }

    fn value_type(&self, value: &Value) -> Result<TypeId, CopyError> {
        Ok(match value {
            Value::I8(_) => self.schema.primitive(PrimKind::I8),
            Value::U8(_) => self.schema.primitive(PrimKind::U8),
            Value::I16(_) => self.schema.primitive(PrimKind::I16),
            Value::U16(_) => self.schema.primitive(PrimKind::U16),
            Value::I32(_) => self.schema.primitive(PrimKind::I32),
            Value::U32(_) => self.schema.primitive(PrimKind::U32),
            Value::I64(_) => self.schema.primitive(PrimKind::I64),
            Value::U64(_) => self.schema.primitive(PrimKind::U64),
            Value::ISize(_) => self.schema.primitive(PrimKind::ISize),
            Value::USize(_) => self.schema.primitive(PrimKind::USize),
            Value::F32(_) => self.schema.primitive(PrimKind::F32),
            Value::F64(_) => self.schema.primitive(PrimKind::F64),
            Value::Bool(_) => self.schema.primitive(PrimKind::Bool),
            Value::Char(_) => self.schema.primitive(PrimKind::Char),
            Value::Struct(record) => record.ty,
            Value::Object(Some(object)) => object.borrow().ty,
            Value::Array(Some(array)) => array.borrow().ty,
            Value::Object(None) | Value::Array(None) => {
                return Err(CopyError::Other(
                    "cannot infer the type of a null root".to_string(),
                ))
            }
        })
    }

    pub(crate) fn type_label(&self, ty: TypeId) -> String {
        self.schema
            .name(ty)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{ty:?}"))
    }

    fn field_mismatch(&self, ty: TypeId, detail: String) -> CopyError {
        CopyError::FieldMismatch {
            type_name: self.type_label(ty),
            detail,
        }
    }

    fn value_shape(&self, expected: &'static str, found: &Value) -> CopyError {
        CopyError::ValueShape {
            expected,
            found: found.kind_name(),
        }
    }
}
