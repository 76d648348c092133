//! Host type registry: the statically declared schema the rest of the
//! system reads instead of runtime reflection.
//!
//! Every host type the engine can handle is registered up front and
//! addressed by a dense [`TypeId`]. The registry is append-only; a
//! definition is immutable once registered.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Dense index of a registered host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Blittable-candidate primitive kinds understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    ISize,
    USize,
    F32,
    F64,
    Bool,
    Char,
}

impl PrimKind {
    /// All primitive kinds, in registration order.
    pub const ALL: [PrimKind; 14] = [
        PrimKind::I8,
        PrimKind::U8,
        PrimKind::I16,
        PrimKind::U16,
        PrimKind::I32,
        PrimKind::U32,
        PrimKind::I64,
        PrimKind::U64,
        PrimKind::ISize,
        PrimKind::USize,
        PrimKind::F32,
        PrimKind::F64,
        PrimKind::Bool,
        PrimKind::Char,
    ];

    /// Canonical qualified name used as the registry key.
    pub fn name(self) -> &'static str {
        match self {
            PrimKind::I8 => "i8",
            PrimKind::U8 => "u8",
            PrimKind::I16 => "i16",
            PrimKind::U16 => "u16",
            PrimKind::I32 => "i32",
            PrimKind::U32 => "u32",
            PrimKind::I64 => "i64",
            PrimKind::U64 => "u64",
            PrimKind::ISize => "isize",
            PrimKind::USize => "usize",
            PrimKind::F32 => "f32",
            PrimKind::F64 => "f64",
            PrimKind::Bool => "bool",
            PrimKind::Char => "char",
        }
    }
}

/// Classification of a host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(PrimKind),
    /// Aggregate copied by value, inlined into its container.
    ValueRecord,
    /// Aggregate reached through a reference; participates in aliasing.
    RefRecord,
    /// Variable-length array; always a reference.
    Array,
}

/// One declared field: name plus declared type.
#[derive(Debug, Clone)]
pub struct HostField {
    pub name: String,
    pub ty: TypeId,
}

/// A registered host type definition.
#[derive(Debug, Clone)]
pub struct HostTypeDef {
    /// Fully qualified name; identity within the registry.
    pub name: String,
    pub kind: TypeKind,
    /// Declared fields in declaration order (records only).
    pub fields: Vec<HostField>,
    /// Base type, if any (records only).
    pub base: Option<TypeId>,
    /// Element type (arrays only).
    pub element: Option<TypeId>,
}

/// Errors raised while building the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("type `{0}` is already registered")]
    DuplicateType(String),

    #[error("field `{field}` of `{record}` names an unregistered type")]
    UnknownFieldType { record: String, field: String },

    #[error("unregistered type id {0:?}")]
    UnknownType(TypeId),

    #[error("record `{0}` is already defined")]
    AlreadyDefined(String),

    #[error("record `{0}` was declared but never defined")]
    UndefinedRecord(String),

    #[error("type `{0}` is not a record")]
    NotARecord(String),

    #[error("record `{0}` cannot appear in its own base chain")]
    BaseCycle(String),
}

/// Append-only table of host type definitions.
///
/// All primitives are pre-registered by [`SchemaRegistry::new`], so a
/// fresh registry can immediately describe scalar fields. Base chains
/// stay acyclic: [`SchemaRegistry::define_record`] rejects any base
/// edge that would close a loop.
pub struct SchemaRegistry {
    defs: Vec<HostTypeDef>,
    by_name: FxHashMap<String, TypeId>,
    /// Records declared but not yet defined (two-phase registration for
    /// self-referential shapes).
    pending: FxHashSet<TypeId>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut registry = SchemaRegistry {
            defs: Vec::new(),
            by_name: FxHashMap::default(),
            pending: FxHashSet::default(),
        };
        for prim in PrimKind::ALL {
            let id = TypeId(registry.defs.len() as u32);
            registry.defs.push(HostTypeDef {
                name: prim.name().to_string(),
                kind: TypeKind::Primitive(prim),
                fields: Vec::new(),
                base: None,
                element: None,
            });
            registry.by_name.insert(prim.name().to_string(), id);
        }
        registry
    }

    /// Id of a pre-registered primitive.
    pub fn primitive(&self, kind: PrimKind) -> TypeId {
        // Primitives occupy the first slots in discriminant order.
        TypeId(kind as u32)
    }

    /// Registers a value aggregate (inlined into containers).
    pub fn register_value_record(
        &mut self,
        name: &str,
        base: Option<TypeId>,
        fields: &[(&str, TypeId)],
    ) -> Result<TypeId, SchemaError> {
        let id = self.declare_record(name, TypeKind::ValueRecord)?;
        self.define_record(id, base, fields)?;
        Ok(id)
    }

    /// Registers a reference aggregate (reached through an address).
    pub fn register_ref_record(
        &mut self,
        name: &str,
        base: Option<TypeId>,
        fields: &[(&str, TypeId)],
    ) -> Result<TypeId, SchemaError> {
        let id = self.declare_record(name, TypeKind::RefRecord)?;
        self.define_record(id, base, fields)?;
        Ok(id)
    }

    /// Forward-declares a value aggregate so its id can appear in its
    /// own (or a mutually recursive) field list. Must be completed with
    /// [`SchemaRegistry::define_record`].
    pub fn declare_value_record(&mut self, name: &str) -> Result<TypeId, SchemaError> {
        self.declare_record(name, TypeKind::ValueRecord)
    }

    /// Forward-declares a reference aggregate. Must be completed with
    /// [`SchemaRegistry::define_record`].
    pub fn declare_ref_record(&mut self, name: &str) -> Result<TypeId, SchemaError> {
        self.declare_record(name, TypeKind::RefRecord)
    }

    fn declare_record(&mut self, name: &str, kind: TypeKind) -> Result<TypeId, SchemaError> {
        if self.by_name.contains_key(name) {
            return Err(SchemaError::DuplicateType(name.to_string()));
        }
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(HostTypeDef {
            name: name.to_string(),
            kind,
            fields: Vec::new(),
            base: None,
            element: None,
        });
        self.by_name.insert(name.to_string(), id);
        self.pending.insert(id);
        Ok(id)
    }

    /// Supplies the base and field list of a declared record, exactly
    /// once. The definition is immutable afterwards.
    pub fn define_record(
        &mut self,
        ty: TypeId,
        base: Option<TypeId>,
        fields: &[(&str, TypeId)],
    ) -> Result<(), SchemaError> {
        let def = self.get(ty).ok_or(SchemaError::UnknownType(ty))?;
        let name = def.name.clone();
        if !matches!(def.kind, TypeKind::ValueRecord | TypeKind::RefRecord) {
            return Err(SchemaError::NotARecord(name));
        }
        if !self.pending.contains(&ty) {
            return Err(SchemaError::AlreadyDefined(name));
        }
        if let Some(base_id) = base {
            if self.get(base_id).is_none() {
                return Err(SchemaError::UnknownType(base_id));
            }
            // Reject a base edge that would close a loop. The walk
            // terminates: every already-defined chain is acyclic.
            let mut cursor = Some(base_id);
            while let Some(current) = cursor {
                if current == ty {
                    return Err(SchemaError::BaseCycle(name));
                }
                cursor = self.get(current).and_then(|d| d.base);
            }
        }
        let mut declared = Vec::with_capacity(fields.len());
        for (field_name, field_ty) in fields {
            if self.get(*field_ty).is_none() {
                return Err(SchemaError::UnknownFieldType {
                    record: name.clone(),
                    field: field_name.to_string(),
                });
            }
            declared.push(HostField {
                name: field_name.to_string(),
                ty: *field_ty,
            });
        }
        let def = &mut self.defs[ty.index()];
        def.base = base;
        def.fields = declared;
        self.pending.remove(&ty);
        Ok(())
    }

    /// True once a record's fields have been supplied. Primitives and
    /// arrays are always defined.
    pub fn is_defined(&self, ty: TypeId) -> bool {
        self.get(ty).is_some() && !self.pending.contains(&ty)
    }

    /// Registers (or returns the existing) array type over `element`.
    ///
    /// Array types are structural: the name is derived from the element
    /// (`i32[]`, `demo.Node[]`), and registering the same element twice
    /// yields the same id.
    pub fn register_array(&mut self, element: TypeId) -> Result<TypeId, SchemaError> {
        let element_def = self.get(element).ok_or(SchemaError::UnknownType(element))?;
        let name = format!("{}[]", element_def.name);
        if let Some(existing) = self.by_name.get(&name) {
            return Ok(*existing);
        }
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(HostTypeDef {
            name: name.clone(),
            kind: TypeKind::Array,
            fields: Vec::new(),
            base: None,
            element: Some(element),
        });
        self.by_name.insert(name, id);
        Ok(id)
    }

    pub fn get(&self, ty: TypeId) -> Option<&HostTypeDef> {
        self.defs.get(ty.index())
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn kind(&self, ty: TypeId) -> Option<TypeKind> {
        self.get(ty).map(|def| def.kind)
    }

    pub fn name(&self, ty: TypeId) -> Option<&str> {
        self.get(ty).map(|def| def.name.as_str())
    }

    pub fn element(&self, ty: TypeId) -> Option<TypeId> {
        self.get(ty).and_then(|def| def.element)
    }

    /// Every per-instance field of `ty`, walking the base chain
    /// root-most base first, then each derived level in declaration
    /// order. This is the field order both the synthesizer and the copy
    /// engine iterate in.
    pub fn chain_fields(&self, ty: TypeId) -> Result<Vec<HostField>, SchemaError> {
        let def = self.get(ty).ok_or(SchemaError::UnknownType(ty))?;
        let mut collected = match def.base {
            Some(base) => self.chain_fields(base)?,
            None => Vec::new(),
        };
        collected.extend(def.fields.iter().cloned());
        Ok(collected)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}
