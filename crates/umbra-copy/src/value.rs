use std::cell::RefCell;
use std::rc::Rc;
use umbra_schema::TypeId;

/// A reference-aggregate instance. `Rc` identity is what the copy
/// engine uses to detect shared references and cycles.
pub type ObjRef = Rc<RefCell<RecordValue>>;

/// An array instance, also identity-tracked.
pub type ArrayRef = Rc<RefCell<ArrayValue>>;

/// Fields of a record instance, named as in the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    pub ty: TypeId,
    pub fields: Vec<(String, Value)>,
}

impl RecordValue {
    pub fn new(ty: TypeId) -> Self {
        RecordValue {
            ty,
            fields: Vec::new(),
        }
    }

    pub fn with_fields(ty: TypeId, fields: Vec<(&str, Value)>) -> Self {
        RecordValue {
            ty,
            fields: fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, value)| value)
    }

    /// Replaces an existing field or appends a new one.
    pub fn set_field(&mut self, name: &str, value: Value) {
        for (field_name, slot) in &mut self.fields {
            if field_name == name {
                *slot = value;
                return;
            }
        }
        self.fields.push((name.to_string(), value));
    }
}

/// Items of an array instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    /// The array type (not the element type).
    pub ty: TypeId,
    pub items: Vec<Value>,
}

impl ArrayValue {
    pub fn new(ty: TypeId, items: Vec<Value>) -> Self {
        ArrayValue { ty, items }
    }
}

/// A host value graph.
///
/// Equality is structural and recurses through references; do not
/// compare cyclic graphs with `==`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    ISize(isize),
    USize(usize),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(char),
    /// A value aggregate, stored inline in its container.
    Struct(RecordValue),
    /// A reference aggregate; `None` is the null reference.
    Object(Option<ObjRef>),
    /// An array reference; `None` is the null reference.
    Array(Option<ArrayRef>),
}

impl Value {
    /// Wraps a record as a fresh reference-aggregate instance.
    pub fn object(record: RecordValue) -> Value {
        Value::Object(Some(Rc::new(RefCell::new(record))))
    }

    /// Wraps an array as a fresh array instance.
    pub fn array(array: ArrayValue) -> Value {
        Value::Array(Some(Rc::new(RefCell::new(array))))
    }

    pub fn null_object() -> Value {
        Value::Object(None)
    }

    pub fn null_array() -> Value {
        Value::Array(None)
    }

    /// Short label used in shape-mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::ISize(_) => "isize",
            Value::USize(_) => "usize",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Char(_) => "char",
            Value::Struct(_) => "struct",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_schema::{PrimKind, SchemaRegistry};

    #[test]
    fn field_lookup_and_replace() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let point = schema
            .register_value_record("demo.Point", None, &[("x", i32_id), ("y", i32_id)])
            .unwrap();
        let mut record =
            RecordValue::with_fields(point, vec![("x", Value::I32(1)), ("y", Value::I32(2))]);
        assert_eq!(record.field("y"), Some(&Value::I32(2)));
        record.set_field("y", Value::I32(9));
        assert_eq!(record.field("y"), Some(&Value::I32(9)));
        assert_eq!(record.fields.len(), 2);
    }

    #[test]
    fn object_identity_is_shared() {
        let mut schema = SchemaRegistry::new();
        let i32_id = schema.primitive(PrimKind::I32);
        let node = schema
            .register_ref_record("demo.Node", None, &[("id", i32_id)])
            .unwrap();
        let shared = Value::object(RecordValue::with_fields(node, vec![("id", Value::I32(1))]));
        let copy = shared.clone();
        match (&shared, &copy) {
            (Value::Object(Some(a)), Value::Object(Some(b))) => {
                assert!(Rc::ptr_eq(a, b));
            }
            _ => panic!("expected objects"),
        }
    }
}
