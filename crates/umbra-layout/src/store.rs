use rustc_hash::FxHashMap;

/// Index of a shadow layout within a [`ShadowStore`].
pub type ShadowIndex = usize;

/// Width of an address slot in the flat layout.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Index of the shared address-placeholder layout, seeded at store
/// construction.
pub const POINTER_SHADOW: ShadowIndex = 0;

/// One field of a record shadow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowField {
    /// Host field name; the copy engine matches on it.
    pub name: Box<str>,
    /// Byte offset of the slot within the record.
    pub offset: usize,
    /// Shadow of the slot itself: [`POINTER_SHADOW`] for out-of-line
    /// fields, the field type's own shadow otherwise.
    pub shadow: ShadowIndex,
    /// True when the slot holds an address to a separately allocated
    /// buffer rather than inline data.
    pub out_of_line: bool,
}

/// A synthesized layout built only from blittable primitives and
/// address/length slots. Immutable once inserted into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowLayout {
    /// A fixed-width scalar slot. `repr` records the host primitive the
    /// slot encodes (bool shadows as one byte, char as u16).
    Primitive {
        size_bytes: usize,
        align_bytes: usize,
        repr: umbra_schema::PrimKind,
    },
    /// A word-sized address slot standing in for an out-of-line value.
    Pointer,
    /// Sequential fields in host declaration order.
    Record {
        size_bytes: usize,
        align_bytes: usize,
        fields: Box<[ShadowField]>,
    },
    /// The `{address, count: i32}` array header. Elements always live in
    /// a separately allocated buffer at `address`.
    Array {
        /// Shadow of one element slot ([`POINTER_SHADOW`] when elements
        /// are themselves out-of-line).
        element: ShadowIndex,
        element_out_of_line: bool,
        /// Distance between consecutive element slots.
        element_stride_bytes: usize,
        /// Byte offset of the `count` field within the header.
        count_offset: usize,
        size_bytes: usize,
        align_bytes: usize,
    },
}

/// Escapes bracket characters in a host type name for use as a cache
/// key; array names contain `[]`.
pub fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '[' || c == ']' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Name-keyed table of synthesized shadow layouts.
///
/// One shadow exists per distinct host type name; entries are added
/// lazily and never removed, so the store can be consulted both during
/// synthesis (terminating reference-kind recursion) and during copy
/// (resolving a shadow without resynthesis).
pub struct ShadowStore {
    descriptors: Vec<ShadowLayout>,
    by_name: FxHashMap<String, ShadowIndex>,
}

impl ShadowStore {
    pub fn new() -> Self {
        ShadowStore {
            // Seed the shared address placeholder at index 0.
            descriptors: vec![ShadowLayout::Pointer],
            by_name: FxHashMap::default(),
        }
    }

    /// Index of the shared address-placeholder layout.
    pub fn pointer_index(&self) -> ShadowIndex {
        POINTER_SHADOW
    }

    pub fn get(&self, index: ShadowIndex) -> Option<&ShadowLayout> {
        self.descriptors.get(index)
    }

    /// Looks up the shadow for a host type name (unescaped).
    pub fn lookup(&self, name: &str) -> Option<ShadowIndex> {
        self.by_name.get(&escape_name(name)).copied()
    }

    /// Inserts a completed layout under a host type name and returns its
    /// index. Existing entries are never replaced.
    pub fn insert(&mut self, name: &str, layout: ShadowLayout) -> ShadowIndex {
        let key = escape_name(name);
        if let Some(existing) = self.by_name.get(&key) {
            return *existing;
        }
        let index = self.descriptors.len();
        self.descriptors.push(layout);
        self.by_name.insert(key, index);
        index
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Slot size in bytes for a shadow.
    pub fn size_bytes(&self, index: ShadowIndex) -> Option<usize> {
        self.get(index).map(|layout| match layout {
            ShadowLayout::Primitive { size_bytes, .. } => *size_bytes,
            ShadowLayout::Pointer => WORD_BYTES,
            ShadowLayout::Record { size_bytes, .. } => *size_bytes,
            ShadowLayout::Array { size_bytes, .. } => *size_bytes,
        })
    }

    /// Slot alignment in bytes for a shadow.
    pub fn align_bytes(&self, index: ShadowIndex) -> Option<usize> {
        self.get(index).map(|layout| match layout {
            ShadowLayout::Primitive { align_bytes, .. } => *align_bytes,
            ShadowLayout::Pointer => WORD_BYTES,
            ShadowLayout::Record { align_bytes, .. } => *align_bytes,
            ShadowLayout::Array { align_bytes, .. } => *align_bytes,
        })
    }
}

impl Default for ShadowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_schema::PrimKind;

    #[test]
    fn escape_brackets() {
        assert_eq!(escape_name("i32[]"), "i32\\[\\]");
        assert_eq!(escape_name("demo.Node"), "demo.Node");
    }

    #[test]
    fn pointer_seeded_at_zero() {
        let store = ShadowStore::new();
        assert_eq!(store.get(POINTER_SHADOW), Some(&ShadowLayout::Pointer));
        assert_eq!(store.size_bytes(POINTER_SHADOW), Some(WORD_BYTES));
    }

    #[test]
    fn insert_is_idempotent_per_name() {
        let mut store = ShadowStore::new();
        let layout = ShadowLayout::Primitive {
            size_bytes: 4,
            align_bytes: 4,
            repr: PrimKind::I32,
        };
        let first = store.insert("i32", layout.clone());
        let second = store.insert("i32", layout);
        assert_eq!(first, second);
        assert_eq!(store.lookup("i32"), Some(first));
    }
}
