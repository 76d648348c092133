use repc::layout::{Record, RecordField, RecordKind, Type, TypeVariant};
use umbra_schema::{HostField, TypeKind};

use crate::store::{ShadowField, ShadowLayout};
use crate::{LayoutError, ShadowSynthesizer, SynthOptions};

pub(crate) fn record_field(ty: Type<()>) -> RecordField<()> {
    RecordField {
        layout: None,
        annotations: vec![],
        named: true,
        bit_width: None,
        ty,
    }
}

pub(crate) fn record_type(fields: Vec<RecordField<()>>) -> Type<()> {
    Type {
        layout: (),
        annotations: vec![],
        variant: TypeVariant::Record(Record {
            kind: RecordKind::Struct,
            fields,
        }),
    }
}

impl<'a> ShadowSynthesizer<'a> {
    /// Computes the shadow layout for a value or reference record.
    ///
    /// Field slots follow host declaration order: reference-record and
    /// array fields become address slots backed by separately allocated
    /// buffers, value-record and primitive fields are inlined. Offsets
    /// come from repc against the host target.
    pub(crate) fn compute_record_layout(
        &mut self,
        ty: umbra_schema::TypeId,
        opts: SynthOptions,
    ) -> Result<ShadowLayout, LayoutError> {
        let schema = self.schema;
        let def = schema
            .get(ty)
            .ok_or(umbra_schema::SchemaError::UnknownType(ty))?;

        if opts.declare_parent_chain {
            // Give every base its own cached shadow before laying out
            // the derived record.
            if let Some(base) = def.base {
                self.synthesize(base, opts)?;
            }
        }

        let host_fields: Vec<HostField> = if opts.flatten || opts.declare_parent_chain {
            schema.chain_fields(ty)?
        } else {
            def.fields.clone()
        };

        // Resolve each field to its slot shadow.
        let mut slots = Vec::with_capacity(host_fields.len());
        for field in &host_fields {
            let field_kind = schema
                .kind(field.ty)
                .ok_or(umbra_schema::SchemaError::UnknownType(field.ty))?;
            match field_kind {
                TypeKind::RefRecord | TypeKind::Array => {
                    // Warm the pointee's shadow when it is computable
                    // now; a pointee whose layout still depends on the
                    // record being laid out resolves lazily at copy
                    // time instead.
                    match self.synthesize(field.ty, opts) {
                        Ok(_) => {}
                        Err(LayoutError::ValueCycle(name)) => {
                            log::debug!(
                                "deferring shadow for `{name}` until `{}` completes",
                                def.name
                            );
                        }
                        Err(other) => return Err(other),
                    }
                    slots.push((field.name.clone(), self.store.pointer_index(), true));
                }
                TypeKind::Primitive(_) | TypeKind::ValueRecord => {
                    let shadow = self.synthesize(field.ty, opts)?;
                    slots.push((field.name.clone(), shadow, false));
                }
            }
        }

        // Build the repc record mirroring the slot sequence.
        let mut record_fields = Vec::with_capacity(slots.len());
        for (_, shadow, out_of_line) in &slots {
            let repc_ty = if *out_of_line {
                crate::builtin_type(repc::layout::BuiltinType::Pointer)
            } else {
                self.shadow_repc_type(*shadow)?
            };
            record_fields.push(record_field(repc_ty));
        }

        let computed = repc::compute_layout(self.target, &record_type(record_fields))
            .map_err(LayoutError::RepcError)?;

        let repc_record = match computed.variant {
            TypeVariant::Record(record) => record,
            _ => return Err(LayoutError::Other("expected record type".to_string())),
        };

        let mut fields = Vec::with_capacity(repc_record.fields.len());
        for (i, field) in repc_record.fields.iter().enumerate() {
            let field_layout = field.layout.unwrap(); // Safe after compute_layout
            let (name, shadow, out_of_line) = &slots[i];
            fields.push(ShadowField {
                name: name.clone().into_boxed_str(),
                offset: (field_layout.offset_bits / 8) as usize,
                shadow: *shadow,
                out_of_line: *out_of_line,
            });
        }

        Ok(ShadowLayout::Record {
            size_bytes: (computed.layout.size_bits / 8) as usize,
            align_bytes: (computed.layout.required_alignment_bits / 8) as usize,
            fields: fields.into_boxed_slice(),
        })
    }
}
