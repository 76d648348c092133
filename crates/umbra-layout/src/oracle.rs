use rustc_hash::{FxHashMap, FxHashSet};
use umbra_schema::{PrimKind, SchemaRegistry, TypeId, TypeKind};

/// Decides whether a host type's in-memory form already contains no
/// managed references and can be handed to a non-managed consumer
/// byte-for-byte.
///
/// The probe walks the registered descriptor and is memoized per type.
/// It never fails: anything it cannot prove blittable is reported as
/// not blittable, and the outcome is only ever a boolean.
pub struct BlittabilityOracle {
    memo: FxHashMap<TypeId, bool>,
    /// Types currently being probed; a revisit means a cycle.
    probing: FxHashSet<TypeId>,
}

impl BlittabilityOracle {
    pub fn new() -> Self {
        BlittabilityOracle {
            memo: FxHashMap::default(),
            probing: FxHashSet::default(),
        }
    }

    pub fn is_blittable(&mut self, schema: &SchemaRegistry, ty: TypeId) -> bool {
        if let Some(&known) = self.memo.get(&ty) {
            return known;
        }
        let result = self.probe(schema, ty);
        self.memo.insert(ty, result);
        result
    }

    fn probe(&mut self, schema: &SchemaRegistry, ty: TypeId) -> bool {
        if !self.probing.insert(ty) {
            // Cyclic shape: cannot be a fixed-size value.
            return false;
        }
        let result = match schema.kind(ty) {
            None => {
                log::warn!("blittability probe on unregistered type id {ty:?}");
                false
            }
            // Bools and 16-bit chars have host widths/semantics that no
            // stable fixed-size binary primitive matches.
            Some(TypeKind::Primitive(prim)) => {
                !matches!(prim, PrimKind::Bool | PrimKind::Char)
            }
            Some(TypeKind::Array) => match schema.element(ty) {
                Some(element) => {
                    let value_kind = matches!(
                        schema.kind(element),
                        Some(TypeKind::Primitive(_)) | Some(TypeKind::ValueRecord)
                    );
                    value_kind && self.is_blittable(schema, element)
                }
                None => false,
            },
            Some(TypeKind::ValueRecord) => match schema.chain_fields(ty) {
                Ok(fields) => fields.iter().all(|f| self.is_blittable(schema, f.ty)),
                Err(_) => false,
            },
            Some(TypeKind::RefRecord) => false,
        };
        self.probing.remove(&ty);
        result
    }
}

impl Default for BlittabilityOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_primitives_are_blittable() {
        let schema = SchemaRegistry::new();
        let mut oracle = BlittabilityOracle::new();
        for prim in [PrimKind::I16, PrimKind::U32, PrimKind::I64, PrimKind::F64] {
            assert!(oracle.is_blittable(&schema, schema.primitive(prim)));
        }
    }

    #[test]
    fn bool_and_char_are_not() {
        let schema = SchemaRegistry::new();
        let mut oracle = BlittabilityOracle::new();
        assert!(!oracle.is_blittable(&schema, schema.primitive(PrimKind::Bool)));
        assert!(!oracle.is_blittable(&schema, schema.primitive(PrimKind::Char)));
    }

    #[test]
    fn array_follows_element() {
        let mut schema = SchemaRegistry::new();
        let i32_arr = {
            let id = schema.primitive(PrimKind::I32);
            schema.register_array(id).unwrap()
        };
        let bool_arr = {
            let id = schema.primitive(PrimKind::Bool);
            schema.register_array(id).unwrap()
        };
        let mut oracle = BlittabilityOracle::new();
        assert!(oracle.is_blittable(&schema, i32_arr));
        assert!(!oracle.is_blittable(&schema, bool_arr));
    }

    #[test]
    fn ref_kinds_are_never_blittable() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let node = schema
            .register_ref_record("demo.Node", None, &[("id", i32_id)])
            .unwrap();
        let node_arr = schema.register_array(node).unwrap();
        let mut oracle = BlittabilityOracle::new();
        assert!(!oracle.is_blittable(&schema, node));
        assert!(!oracle.is_blittable(&schema, node_arr));
    }

    #[test]
    fn value_record_requires_all_fields_blittable() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let bool_id = schema.primitive(PrimKind::Bool);
        let clean = schema
            .register_value_record("demo.Clean", None, &[("a", i32_id), ("b", i32_id)])
            .unwrap();
        let tainted = schema
            .register_value_record("demo.Tainted", None, &[("a", i32_id), ("b", bool_id)])
            .unwrap();
        let mut oracle = BlittabilityOracle::new();
        assert!(oracle.is_blittable(&schema, clean));
        assert!(!oracle.is_blittable(&schema, tainted));
        // Memoized answers stay stable.
        assert!(oracle.is_blittable(&schema, clean));
    }
}
