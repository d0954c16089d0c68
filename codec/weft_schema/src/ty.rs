//! The schema type tree.
//!
//! A schema is described by a [`TypeNode`] tree and compiled once into a
//! [`crate::Schema`]. The enum is closed on purpose: the layout engine and
//! the compatibility-map builder match exhaustively over it, so adding a
//! kind is a compile-time event everywhere it matters.

/// Primitive wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Bytes,
}

impl PrimKind {
    /// Encoded width for fixed-length primitives; `None` for
    /// self-delimiting variable-length ones.
    pub fn fixed_len(self) -> Option<u32> {
        match self {
            PrimKind::Bool | PrimKind::I8 => Some(1),
            PrimKind::I16 => Some(2),
            PrimKind::I32 | PrimKind::F32 => Some(4),
            PrimKind::I64 | PrimKind::F64 => Some(8),
            PrimKind::Str | PrimKind::Bytes => None,
        }
    }

    /// Stable numeric code, used for schema ids and compatibility checks.
    pub fn type_code(self) -> u8 {
        match self {
            PrimKind::Bool => 1,
            PrimKind::I8 => 2,
            PrimKind::I16 => 3,
            PrimKind::I32 => 4,
            PrimKind::I64 => 5,
            PrimKind::F32 => 6,
            PrimKind::F64 => 7,
            PrimKind::Str => 8,
            PrimKind::Bytes => 9,
        }
    }
}

/// One node of a schema type tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeNode {
    /// Fixed sequence of members, all present together.
    Tuple(Vec<TypeNode>),
    /// Choice point: exactly one case is present at a time.
    Variant(Vec<TypeNode>),
    /// Repeated element.
    List(Box<TypeNode>),
    /// Primitive leaf.
    Prim(PrimKind),
    /// Small closed integer domain; encoded as a fixed `i32`.
    Enum { enumerators: u32 },
    /// A nested message carrying its own schema id on the wire.
    Dynamic,
}

impl TypeNode {
    /// The empty tuple, the unit type of the deleting-variant convention.
    pub fn empty_tuple() -> TypeNode {
        TypeNode::Tuple(Vec::new())
    }

    pub fn is_empty_tuple(&self) -> bool {
        matches!(self, TypeNode::Tuple(members) if members.is_empty())
    }

    /// A two-case variant whose second case is the empty tuple: the shape
    /// used to mark a field that newer schema versions may omit.
    pub fn is_deleting_variant(&self) -> bool {
        matches!(self, TypeNode::Variant(cases)
            if cases.len() == 2 && cases[1].is_empty_tuple())
    }
}
