//! Graph copy engine: walks a host value graph once and produces (or
//! consumes) the exact binary shape its shadow layout describes,
//! preserving shared references and cycles.

use thiserror::Error;
use umbra_heap::HeapError;
use umbra_layout::LayoutError;
use umbra_schema::SchemaError;

mod engine;
mod release;
mod value;

pub use engine::GraphCopier;
pub use value::{ArrayRef, ArrayValue, ObjRef, RecordValue, Value};

/// Errors that can occur while copying a graph in either direction.
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("unknown host type: {0}")]
    UnknownType(String),

    #[error("shadow and host fields disagree for `{type_name}`: {detail}")]
    FieldMismatch { type_name: String, detail: String },

    #[error("value shape mismatch: expected {expected}, found {found}")]
    ValueShape {
        expected: &'static str,
        found: &'static str,
    },

    #[error("array length {0} exceeds the i32 header range")]
    CountOverflow(usize),

    #[error("char U+{0:04X} does not fit the 16-bit shadow slot")]
    CharRange(u32),

    #[error("invalid 16-bit char value {0:#06x} in buffer")]
    InvalidChar(u16),

    #[error("layout synthesis failed: {0}")]
    Layout(#[from] LayoutError),

    #[error("heap operation failed: {0}")]
    Heap(#[from] HeapError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("other copy error: {0}")]
    Other(String),
}
