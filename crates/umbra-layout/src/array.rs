use repc::layout::{BuiltinType, TypeVariant};
use umbra_schema::{SchemaError, TypeId, TypeKind};

use crate::record::{record_field, record_type};
use crate::store::ShadowLayout;
use crate::{builtin_type, LayoutError, ShadowSynthesizer, SynthOptions};

impl<'a> ShadowSynthesizer<'a> {
    /// Computes the `{address, count: i32}` header layout for an array
    /// type. Element storage is never part of the static layout; the
    /// copy engine sizes and fills a separately allocated buffer at
    /// copy time using the stride recorded here.
    pub(crate) fn compute_array_layout(
        &mut self,
        element_ty: TypeId,
        opts: SynthOptions,
    ) -> Result<ShadowLayout, LayoutError> {
        let element_kind = self
            .schema
            .kind(element_ty)
            .ok_or(SchemaError::UnknownType(element_ty))?;

        let element_shadow = self.synthesize(element_ty, opts)?;

        // Element slots follow the field rule: reference-kind elements
        // are stored as addresses, value-kind elements inline.
        let (element, element_out_of_line) = match element_kind {
            TypeKind::RefRecord | TypeKind::Array => (self.store.pointer_index(), true),
            TypeKind::Primitive(_) | TypeKind::ValueRecord => (element_shadow, false),
        };

        let element_size = self
            .store
            .size_bytes(element)
            .ok_or(LayoutError::MissingShadow(element))?;
        let element_align = self
            .store
            .align_bytes(element)
            .ok_or(LayoutError::MissingShadow(element))?;

        // Stride is size rounded up to alignment.
        let element_stride_bytes = if element_align > 0 {
            (element_size + element_align - 1) & !(element_align - 1)
        } else {
            element_size
        };

        // Header layout comes from repc, same as records.
        let header = record_type(vec![
            record_field(builtin_type(BuiltinType::Pointer)),
            record_field(builtin_type(BuiltinType::Int)),
        ]);
        let computed =
            repc::compute_layout(self.target, &header).map_err(LayoutError::RepcError)?;

        let repc_record = match computed.variant {
            TypeVariant::Record(record) => record,
            _ => return Err(LayoutError::Other("expected record type".to_string())),
        };
        let count_layout = repc_record.fields[1].layout.unwrap(); // Safe after compute_layout

        Ok(ShadowLayout::Array {
            element,
            element_out_of_line,
            element_stride_bytes,
            count_offset: (count_layout.offset_bits / 8) as usize,
            size_bytes: (computed.layout.size_bits / 8) as usize,
            align_bytes: (computed.layout.required_alignment_bits / 8) as usize,
        })
    }
}
