//! Schema descriptors for the Weft message codec.
//!
//! A schema is declared as a [`TypeNode`] tree and compiled by
//! [`Schema::new`] into the immutable tables everything else runs on:
//! accessor numbering, dominator links, multi-choice counts, and the
//! code-tree skeleton the layout engine walks.

mod error;
mod schema;
mod ty;

pub use error::{CodecError, Result};
pub use schema::{
    BoxedDecl, CodeNode, ElemDecl, FieldDecl, FieldTy, Schema, SchemaResolver, SchemaSet,
    VariantDecl,
};
pub use ty::{PrimKind, TypeNode};

#[cfg(test)]
mod tests;
