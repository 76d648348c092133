//! Shadow-layout synthesis: derives, for any registered host type, an
//! isomorphic layout built only from blittable primitives and
//! address/length slots.
//!
//! Uses the repc crate to calculate C-compatible record layouts, which
//! are then frozen into [`ShadowLayout`] descriptors for the copy
//! engine.

use repc::layout::{BuiltinType, Type, TypeVariant};
use repc::Target;
use rustc_hash::FxHashSet;
use thiserror::Error;
use umbra_schema::{PrimKind, SchemaError, SchemaRegistry, TypeId, TypeKind};

mod array;
mod oracle;
mod record;
mod store;

pub use oracle::BlittabilityOracle;
pub use store::{
    escape_name, ShadowField, ShadowIndex, ShadowLayout, ShadowStore, POINTER_SHADOW, WORD_BYTES,
};

/// Errors that can occur during shadow synthesis.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("unknown host type: {0}")]
    UnknownType(String),

    #[error("self-referential value type `{0}` has no finite layout")]
    ValueCycle(String),

    #[error("layout computation failed: {0}")]
    RepcError(#[from] repc::Error),

    #[error("missing shadow for index: {0}")]
    MissingShadow(ShadowIndex),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("other layout error: {0}")]
    Other(String),
}

/// How a record's base chain is folded into its shadow.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthOptions {
    /// Synthesize base-type shadows first and inherit their layout.
    pub declare_parent_chain: bool,
    /// Merge every inherited field into one standalone layout instead of
    /// building a parent-shadow chain.
    pub flatten: bool,
}

impl SynthOptions {
    /// The copy engine's configuration: one flat record per type
    /// covering the entire base chain.
    pub fn flattened() -> Self {
        SynthOptions {
            declare_parent_chain: false,
            flatten: true,
        }
    }
}

/// Synthesizes shadow layouts for host types, memoizing results in a
/// [`ShadowStore`].
///
/// One synthesizer is created per logical synthesis pass; it owns the
/// in-progress set used to detect recursive types, while the store it
/// borrows is the long-lived cache.
pub struct ShadowSynthesizer<'a> {
    schema: &'a SchemaRegistry,
    store: &'a mut ShadowStore,
    /// Target platform for layout computation.
    target: Target,
    /// Types whose record layout is currently being computed.
    in_progress: FxHashSet<TypeId>,
}

impl<'a> ShadowSynthesizer<'a> {
    pub fn new(schema: &'a SchemaRegistry, store: &'a mut ShadowStore) -> Self {
        ShadowSynthesizer {
            schema,
            store,
            target: repc::HOST_TARGET.expect("host target should be available"),
            in_progress: FxHashSet::default(),
        }
    }

    /// Gets or synthesizes the shadow for a host type.
    ///
    /// Cache hits return the existing index; a reference-kind type
    /// re-entered while its own layout is still being computed resolves
    /// to the shared address placeholder, which is what terminates
    /// reference-kind self-reference.
    pub fn synthesize(
        &mut self,
        ty: TypeId,
        opts: SynthOptions,
    ) -> Result<ShadowIndex, LayoutError> {
        let def = self
            .schema
            .get(ty)
            .ok_or(SchemaError::UnknownType(ty))?;

        if let Some(index) = self.store.lookup(&def.name) {
            return Ok(index);
        }

        if self.in_progress.contains(&ty) {
            return match def.kind {
                // A value type reaching itself inline would imply an
                // infinite layout.
                TypeKind::ValueRecord => Err(LayoutError::ValueCycle(def.name.clone())),
                // Reference-kind recursion resolves to an address slot.
                _ => Ok(self.store.pointer_index()),
            };
        }

        match def.kind {
            TypeKind::Primitive(prim) => {
                let layout = primitive_layout(prim);
                Ok(self.store.insert(&def.name, layout))
            }
            TypeKind::Array => {
                let element = def
                    .element
                    .ok_or_else(|| LayoutError::Other(format!("array `{}` has no element type", def.name)))?;
                self.in_progress.insert(ty);
                let result = self.compute_array_layout(element, opts);
                self.in_progress.remove(&ty);
                let layout = result?;
                let index = self.store.insert(&def.name, layout);
                log::debug!("synthesized array shadow `{}`", def.name);
                Ok(index)
            }
            TypeKind::ValueRecord | TypeKind::RefRecord => {
                if !self.schema.is_defined(ty) {
                    return Err(SchemaError::UndefinedRecord(def.name.clone()).into());
                }
                self.in_progress.insert(ty);
                let result = self.compute_record_layout(ty, opts);
                self.in_progress.remove(&ty);
                let layout = result?;
                let field_count = match &layout {
                    ShadowLayout::Record { fields, .. } => fields.len(),
                    _ => 0,
                };
                let index = self.store.insert(&def.name, layout);
                log::debug!(
                    "synthesized record shadow `{}`: {} fields, {} bytes",
                    def.name,
                    field_count,
                    self.store.size_bytes(index).unwrap_or(0)
                );
                Ok(index)
            }
        }
    }

    /// Converts a shadow slot to the repc type used for offset
    /// computation. Out-of-line slots never reach this; they are encoded
    /// as pointers by the caller.
    pub(crate) fn shadow_repc_type(&self, index: ShadowIndex) -> Result<Type<()>, LayoutError> {
        let layout = self
            .store
            .get(index)
            .ok_or(LayoutError::MissingShadow(index))?;
        match layout {
            ShadowLayout::Primitive { repr, .. } => Ok(builtin_type(primitive_builtin(*repr))),
            ShadowLayout::Pointer => Ok(builtin_type(BuiltinType::Pointer)),
            ShadowLayout::Record { fields, .. } => {
                let mut record_fields = Vec::with_capacity(fields.len());
                for field in fields.iter() {
                    let ty = if field.out_of_line {
                        builtin_type(BuiltinType::Pointer)
                    } else {
                        self.shadow_repc_type(field.shadow)?
                    };
                    record_fields.push(record::record_field(ty));
                }
                Ok(record::record_type(record_fields))
            }
            // Array headers are always out-of-line; encountering one
            // inline would be a synthesizer bug.
            ShadowLayout::Array { .. } => Err(LayoutError::Other(
                "array header cannot be inlined into a record".to_string(),
            )),
        }
    }
}

/// Shadow layout for a primitive kind. Bools shadow as a single byte
/// (true=1, false=0) and chars as a 16-bit unsigned slot; everything
/// else passes through at its native width.
pub(crate) fn primitive_layout(prim: PrimKind) -> ShadowLayout {
    let (size_bytes, align_bytes) = match prim {
        PrimKind::I8 | PrimKind::U8 | PrimKind::Bool => (1, 1),
        PrimKind::I16 | PrimKind::U16 | PrimKind::Char => (2, 2),
        PrimKind::I32 | PrimKind::U32 | PrimKind::F32 => (4, 4),
        PrimKind::I64 | PrimKind::U64 | PrimKind::F64 => (8, 8),
        PrimKind::ISize | PrimKind::USize => (WORD_BYTES, WORD_BYTES),
    };
    ShadowLayout::Primitive {
        size_bytes,
        align_bytes,
        repr: prim,
    }
}

/// Maps a primitive shadow to the repc builtin with the same width.
fn primitive_builtin(prim: PrimKind) -> BuiltinType {
    match prim {
        PrimKind::I8 => BuiltinType::Char,
        PrimKind::U8 => BuiltinType::UnsignedChar,
        PrimKind::I16 => BuiltinType::Short,
        PrimKind::U16 => BuiltinType::UnsignedShort,
        PrimKind::I32 => BuiltinType::Int,
        PrimKind::U32 => BuiltinType::UnsignedInt,
        PrimKind::I64 => BuiltinType::LongLong,
        PrimKind::U64 => BuiltinType::UnsignedLongLong,
        PrimKind::ISize | PrimKind::USize => BuiltinType::Pointer,
        PrimKind::F32 => BuiltinType::Float,
        PrimKind::F64 => BuiltinType::Double,
        PrimKind::Bool => BuiltinType::UnsignedChar,
        PrimKind::Char => BuiltinType::UnsignedShort,
    }
}

pub(crate) fn builtin_type(builtin: BuiltinType) -> Type<()> {
    Type {
        layout: (),
        annotations: vec![],
        variant: TypeVariant::Builtin(builtin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with_point() -> (SchemaRegistry, TypeId) {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let i64_id = schema.primitive(PrimKind::I64);
        let point = schema
            .register_value_record("demo.Point", None, &[("x", i32_id), ("y", i64_id)])
            .unwrap();
        (schema, point)
    }

    #[test]
    fn primitive_passthrough() {
        let schema = SchemaRegistry::new();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let idx = synth
            .synthesize(schema.primitive(PrimKind::I32), SynthOptions::default())
            .unwrap();
        assert_eq!(
            store.get(idx),
            Some(&ShadowLayout::Primitive {
                size_bytes: 4,
                align_bytes: 4,
                repr: PrimKind::I32
            })
        );
    }

    #[test]
    fn bool_and_char_narrow() {
        let schema = SchemaRegistry::new();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let bool_idx = synth
            .synthesize(schema.primitive(PrimKind::Bool), SynthOptions::default())
            .unwrap();
        let char_idx = synth
            .synthesize(schema.primitive(PrimKind::Char), SynthOptions::default())
            .unwrap();
        assert_eq!(store.size_bytes(bool_idx), Some(1));
        assert_eq!(store.size_bytes(char_idx), Some(2));
    }

    #[test]
    fn synthesis_is_idempotent() {
        let (schema, point) = schema_with_point();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let first = synth.synthesize(point, SynthOptions::flattened()).unwrap();
        let second = synth.synthesize(point, SynthOptions::flattened()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn record_offsets_use_natural_alignment() {
        let (schema, point) = schema_with_point();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let idx = synth.synthesize(point, SynthOptions::flattened()).unwrap();
        match store.get(idx).unwrap() {
            ShadowLayout::Record {
                size_bytes, fields, ..
            } => {
                // i32 at 0, i64 padded to 8, total 16.
                assert_eq!(fields[0].offset, 0);
                assert_eq!(fields[1].offset, 8);
                assert_eq!(*size_bytes, 16);
            }
            other => panic!("expected record shadow, got {other:?}"),
        }
    }

    #[test]
    fn ref_fields_become_address_slots() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let node = schema
            .register_ref_record("demo.Node", None, &[("id", i32_id)])
            .unwrap();
        let holder = schema
            .register_value_record("demo.Holder", None, &[("node", node), ("id", i32_id)])
            .unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let idx = synth.synthesize(holder, SynthOptions::flattened()).unwrap();
        match store.get(idx).unwrap() {
            ShadowLayout::Record { fields, .. } => {
                assert!(fields[0].out_of_line);
                assert_eq!(fields[0].shadow, POINTER_SHADOW);
                assert!(!fields[1].out_of_line);
            }
            other => panic!("expected record shadow, got {other:?}"),
        }
        // The pointee's shadow was warmed into the cache as well.
        assert!(store.lookup("demo.Node").is_some());
    }

    #[test]
    fn self_referential_ref_record_terminates() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let list = schema.declare_ref_record("demo.List").unwrap();
        schema
            .define_record(list, None, &[("next", list), ("value", i32_id)])
            .unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let idx = synth.synthesize(list, SynthOptions::flattened()).unwrap();
        match store.get(idx).unwrap() {
            ShadowLayout::Record { fields, .. } => {
                // The self-reference resolved to an address slot.
                assert!(fields[0].out_of_line);
                assert_eq!(fields[0].shadow, POINTER_SHADOW);
            }
            other => panic!("expected record shadow, got {other:?}"),
        }
    }

    #[test]
    fn value_cycle_is_rejected() {
        // A value record reaching itself inline has no finite layout.
        let mut schema = SchemaRegistry::new();
        let cell = schema.declare_value_record("demo.Cell").unwrap();
        schema.define_record(cell, None, &[("inner", cell)]).unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let err = synth.synthesize(cell, SynthOptions::default()).unwrap_err();
        assert!(matches!(err, LayoutError::ValueCycle(_)));
    }

    #[test]
    fn parent_chain_caches_base_shadows() {
        let mut schema = SchemaRegistry::new();
        let i64_id = schema.primitive(PrimKind::I64);
        let i32_id = schema.primitive(PrimKind::I32);
        let base = schema
            .register_ref_record("demo.Entity", None, &[("id", i64_id)])
            .unwrap();
        let derived = schema
            .register_ref_record("demo.Tagged", Some(base), &[("tag", i32_id)])
            .unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let opts = SynthOptions {
            declare_parent_chain: true,
            flatten: false,
        };
        let idx = synth.synthesize(derived, opts).unwrap();
        // The base got its own cache entry, and the derived layout
        // starts with the inherited field.
        assert!(store.lookup("demo.Entity").is_some());
        match store.get(idx).unwrap() {
            ShadowLayout::Record { fields, .. } => {
                let names: Vec<_> = fields.iter().map(|f| &*f.name).collect();
                assert_eq!(names, vec!["id", "tag"]);
            }
            other => panic!("expected record shadow, got {other:?}"),
        }
    }

    #[test]
    fn standalone_layout_covers_declared_fields_only() {
        let mut schema = SchemaRegistry::new();
        let i64_id = schema.primitive(PrimKind::I64);
        let i32_id = schema.primitive(PrimKind::I32);
        let base = schema
            .register_ref_record("demo.Entity", None, &[("id", i64_id)])
            .unwrap();
        let derived = schema
            .register_ref_record("demo.Tagged", Some(base), &[("tag", i32_id)])
            .unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let idx = synth.synthesize(derived, SynthOptions::default()).unwrap();
        match store.get(idx).unwrap() {
            ShadowLayout::Record { fields, .. } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(&*fields[0].name, "tag");
            }
            other => panic!("expected record shadow, got {other:?}"),
        }
        // The base was not synthesized along the way.
        assert!(store.lookup("demo.Entity").is_none());
    }

    #[test]
    fn array_of_enclosing_value_record_is_deferred() {
        // demo.Packet { tail: demo.Packet[], len: i32 } is legal: the
        // array is out-of-line, so the record layout closes without it.
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let packet = schema.declare_value_record("demo.Packet").unwrap();
        let arr = schema.register_array(packet).unwrap();
        schema
            .define_record(packet, None, &[("tail", arr), ("len", i32_id)])
            .unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let packet_idx = synth.synthesize(packet, SynthOptions::flattened()).unwrap();
        // The array's element stride needed the record size, so it was
        // deferred, not cached.
        assert!(store.lookup("demo.Packet[]").is_none());
        let packet_size = store.size_bytes(packet_idx).unwrap();
        // A later request resolves it against the completed record.
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let arr_idx = synth.synthesize(arr, SynthOptions::flattened()).unwrap();
        match store.get(arr_idx).unwrap() {
            ShadowLayout::Array {
                element_stride_bytes,
                ..
            } => assert_eq!(*element_stride_bytes, packet_size),
            other => panic!("expected array shadow, got {other:?}"),
        }
    }

    #[test]
    fn undefined_record_is_rejected() {
        let mut schema = SchemaRegistry::new();
        let ghost = schema.declare_ref_record("demo.Ghost").unwrap();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let err = synth.synthesize(ghost, SynthOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::Schema(SchemaError::UndefinedRecord(_))
        ));
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let schema = SchemaRegistry::new();
        let mut store = ShadowStore::new();
        let mut synth = ShadowSynthesizer::new(&schema, &mut store);
        let bogus = {
            // Forge an out-of-range id through a second registry with
            // more entries.
            let mut other = SchemaRegistry::new();
            let i32_id = other.primitive(PrimKind::I32);
            other.register_array(i32_id).unwrap()
        };
        let err = synth.synthesize(bogus, SynthOptions::default()).unwrap_err();
        assert!(matches!(err, LayoutError::Schema(SchemaError::UnknownType(_))));
    }
}
