use rustc_hash::FxHashSet;

use umbra_heap::{BackingAllocator, NativeAddr};
use umbra_layout::ShadowLayout;
use umbra_schema::{TypeId, TypeKind};

use crate::engine::GraphCopier;
use crate::CopyError;

impl<'a, A: BackingAllocator> GraphCopier<'a, A> {
    /// Frees an entire buffer tree produced by
    /// [`GraphCopier::to_native`], leaf-first, visiting each shared
    /// buffer exactly once so aliased subtrees are not double-freed.
    /// Returns the number of allocations released.
    pub fn release_graph(&mut self, addr: NativeAddr, ty: TypeId) -> Result<usize, CopyError> {
        let mut visited = FxHashSet::default();
        let mut freed = 0usize;
        self.release_any(&mut visited, &mut freed, addr, ty)?;
        log::debug!("released {freed} buffers from {addr}");
        Ok(freed)
    }

    fn release_any(
        &mut self,
        visited: &mut FxHashSet<NativeAddr>,
        freed: &mut usize,
        addr: NativeAddr,
        ty: TypeId,
    ) -> Result<(), CopyError> {
        if addr.is_null() || !visited.insert(addr) {
            return Ok(());
        }
        match self.kind_of(ty)? {
            TypeKind::Primitive(_) => self.free_one(addr, freed)?,
            TypeKind::ValueRecord | TypeKind::RefRecord => {
                // Children first: the buffer is read while walking, so
                // it is freed only after every embedded address is.
                self.release_record_children(visited, freed, ty, addr, 0)?;
                self.free_one(addr, freed)?;
            }
            TypeKind::Array => {
                let shadow = self.shadow_of(ty)?;
                let (stride, count_offset, element_out_of_line) = match self.shadows.get(shadow) {
                    Some(ShadowLayout::Array {
                        element_stride_bytes,
                        count_offset,
                        element_out_of_line,
                        ..
                    }) => (*element_stride_bytes, *count_offset, *element_out_of_line),
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

                let elements = NativeAddr::from_raw(self.heap.read_word(addr, 0)?);
                let count = self.heap.read_i32(addr, count_offset)?.max(0) as usize;

                if element_out_of_line {
                    for i in 0..count {
                        let word = self.heap.read_word(elements, i * stride)?;
                        if word != 0 {
                            self.release_any(
                                visited,
                                freed,
                                NativeAddr::from_raw(word),
                                element_ty,
                            )?;
                        }
                    }
                } else if matches!(self.kind_of(element_ty)?, TypeKind::ValueRecord) {
                    // Inline value-record elements can still hold
                    // addresses in their own fields.
                    for i in 0..count {
                        self.release_record_children(
                            visited,
                            freed,
                            element_ty,
                            elements,
                            i * stride,
                        )?;
                    }
                }
                if !elements.is_null() {
                    self.free_one(elements, freed)?;
                }
                self.free_one(addr, freed)?;
            }
        }
        Ok(())
    }

    /// Releases everything reachable through a record's fields without
    /// freeing the record's own buffer (it may be inline in a parent).
    fn release_record_children(
        &mut self,
        visited: &mut FxHashSet<NativeAddr>,
        freed: &mut usize,
        ty: TypeId,
        addr: NativeAddr,
        base_offset: usize,
    ) -> Result<(), CopyError> {
        let shadow_fields = self.record_shadow_fields(ty)?;
        let host_fields = self.schema.chain_fields(ty)?;
        for (i, shadow_field) in shadow_fields.iter().enumerate() {
            let host_ty = match host_fields.get(i) {
                Some(field) => field.ty,
                None => break,
            };
            if shadow_field.out_of_line {
                let word = self.heap.read_word(addr, base_offset + shadow_field.offset)?;
                if word != 0 {
                    self.release_any(visited, freed, NativeAddr::from_raw(word), host_ty)?;
                }
            } else if matches!(self.kind_of(host_ty)?, TypeKind::ValueRecord) {
                self.release_record_children(
                    visited,
                    freed,
                    host_ty,
                    addr,
                    base_offset + shadow_field.offset,
                )?;
            }
        }
        Ok(())
    }

    fn free_one(&mut self, addr: NativeAddr, freed: &mut usize) -> Result<(), CopyError> {
        self.heap.free(addr)?;
        *freed += 1;
        Ok(())
    }
}
