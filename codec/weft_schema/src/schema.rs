//! Compiled schema descriptors.
//!
//! [`Schema::new`] walks a [`TypeNode`] tree once and derives every table
//! the rest of the system needs: the ordered field list, the ordered
//! unboxed-variant list, boxed accessor pairs, dominator links, per-subtree
//! multi-choice counts, and a structural id. A `Schema` is immutable after
//! construction and always handled as `Arc<Schema>`.
//!
//! Accessor numbering is stable for the lifetime of the schema:
//! `[0, field_count)` are fields, then `[field_count, first_boxed)` are
//! unboxed variants (case get/set), then `[first_boxed, accessor_limit)`
//! are boxed accessors.

use std::hash::Hasher;
use std::sync::Arc;

use num_bigint::BigUint;
use rustc_hash::FxHasher;

use crate::error::{CodecError, Result};
use crate::ty::{PrimKind, TypeNode};

/// Element type of a repeated field.
#[derive(Debug, Clone)]
pub enum ElemDecl {
    Prim(PrimKind),
    Enum { enumerators: u32 },
    Dynamic,
    /// Structured element: each item is a nested part under its own schema.
    /// This covers tuples, nested lists, and boxed variants.
    Part(Arc<Schema>),
}

/// Field type, as seen by codecs and the layout engine.
#[derive(Debug, Clone)]
pub enum FieldTy {
    Prim(PrimKind),
    Enum { enumerators: u32 },
    Dynamic,
    List(ElemDecl),
}

impl FieldTy {
    /// Encoded width for fixed-length fields, `None` for varying ones.
    pub fn fixed_len(&self) -> Option<u32> {
        match self {
            FieldTy::Prim(p) => p.fixed_len(),
            FieldTy::Enum { .. } => Some(4),
            FieldTy::Dynamic | FieldTy::List(_) => None,
        }
    }

    pub fn is_varying(&self) -> bool {
        self.fixed_len().is_none()
    }
}

/// One field of a schema, in declaration order.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub ty: FieldTy,
    /// Nearest enclosing (variant index, case index), if any. The field is
    /// structurally present only while that variant holds that case.
    pub dominator: Option<(usize, usize)>,
}

/// One unboxed variant (choice point) of a schema.
#[derive(Debug, Clone)]
pub struct VariantDecl {
    /// Number of cases.
    pub cases: usize,
    /// Multi-choice count of each case subtree.
    pub case_counts: Vec<BigUint>,
    /// Sum of `case_counts`.
    pub total: BigUint,
    /// Nearest enclosing (variant index, case index), if any.
    pub dominator: Option<(usize, usize)>,
}

/// One boxed accessor: variant content hoisted out of a repeated list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxedDecl {
    /// Field accessor of the box list this entry reads through.
    pub box_field: usize,
    /// Accessor within the box sub-schema, applied to every element.
    pub inner: usize,
}

/// Skeleton of the type tree the layout engine walks: tuples, indexed
/// unboxed variants, and leaves. Lists and everything below them are
/// leaves here because their choices live in their own sub-schemas.
#[derive(Debug, Clone)]
pub enum CodeNode {
    Tuple(Vec<CodeNode>),
    Variant { index: usize, cases: Vec<CodeNode> },
    Leaf,
}

impl CodeNode {
    /// Multi-choice count of this subtree.
    pub fn count(&self, variants: &[VariantDecl]) -> BigUint {
        match self {
            CodeNode::Leaf => BigUint::from(1u32),
            CodeNode::Tuple(members) => members
                .iter()
                .map(|m| m.count(variants))
                .product(),
            CodeNode::Variant { index, .. } => variants[*index].total.clone(),
        }
    }
}

/// An immutable, compiled message schema.
#[derive(Debug)]
pub struct Schema {
    root: TypeNode,
    id: u64,
    fields: Vec<FieldDecl>,
    variants: Vec<VariantDecl>,
    boxed: Vec<BoxedDecl>,
    code_tree: CodeNode,
    multi_choice_count: BigUint,
}

impl Schema {
    /// Compile a type tree into a schema.
    ///
    /// Fails with [`CodecError::SchemaViolation`] on degenerate shapes
    /// (a variant with no cases has no valid layout at all).
    pub fn new(root: TypeNode) -> Result<Arc<Schema>> {
        let mut build = Build::default();
        let code_tree = build.compile(&root, None)?;
        let multi_choice_count = code_tree.count(&build.variants);
        let id = structural_id(&root);
        Ok(Arc::new(Schema {
            root,
            id,
            fields: build.fields,
            variants: build.variants,
            boxed: build.boxed,
            code_tree,
            multi_choice_count,
        }))
    }

    /// Structural id: equal trees hash equal, independent of declaration
    /// site. Used on the wire to name dependent schemas.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn root(&self) -> &TypeNode {
        &self.root
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn variants(&self) -> &[VariantDecl] {
        &self.variants
    }

    pub fn boxed(&self) -> &[BoxedDecl] {
        &self.boxed
    }

    pub fn code_tree(&self) -> &CodeNode {
        &self.code_tree
    }

    /// Number of distinct shapes this schema admits.
    pub fn multi_choice_count(&self) -> &BigUint {
        &self.multi_choice_count
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// First accessor in the boxed range.
    pub fn first_boxed(&self) -> usize {
        self.fields.len() + self.variants.len()
    }

    /// One past the last valid accessor.
    pub fn accessor_limit(&self) -> usize {
        self.first_boxed() + self.boxed.len()
    }

    /// Whether `choices` (one recorded case per variant, `-1` = unset) is
    /// consistent for the given variant: every dominator up the chain must
    /// have chosen the case that contains it. A slice too short to record
    /// a dominator's choice is inconsistent, not a panic.
    pub fn choice_consistent(&self, choices: &[i32], variant: usize) -> bool {
        let mut dom = self.variants[variant].dominator;
        while let Some((v, c)) = dom {
            if choices.get(v).copied() != i32::try_from(c).ok() {
                return false;
            }
            dom = self.variants[v].dominator;
        }
        true
    }

    /// Whether a field's presence is consistent with `choices`. The choice
    /// vector is assumed self-consistent, so only the nearest dominator is
    /// checked.
    pub fn field_consistent(&self, choices: &[i32], field: usize) -> bool {
        match self.fields[field].dominator {
            Some((v, c)) => choices.get(v).copied() == i32::try_from(c).ok(),
            None => true,
        }
    }
}

#[derive(Default)]
struct Build {
    fields: Vec<FieldDecl>,
    variants: Vec<VariantDecl>,
    boxed: Vec<BoxedDecl>,
}

impl Build {
    fn compile(&mut self, node: &TypeNode, dom: Option<(usize, usize)>) -> Result<CodeNode> {
        match node {
            TypeNode::Tuple(members) => {
                let mut kids = Vec::with_capacity(members.len());
                for member in members {
                    kids.push(self.compile(member, dom)?);
                }
                Ok(CodeNode::Tuple(kids))
            }
            TypeNode::Prim(p) => {
                self.fields.push(FieldDecl {
                    ty: FieldTy::Prim(*p),
                    dominator: dom,
                });
                Ok(CodeNode::Leaf)
            }
            TypeNode::Enum { enumerators } => {
                self.fields.push(FieldDecl {
                    ty: FieldTy::Enum {
                        enumerators: *enumerators,
                    },
                    dominator: dom,
                });
                Ok(CodeNode::Leaf)
            }
            TypeNode::Dynamic => {
                self.fields.push(FieldDecl {
                    ty: FieldTy::Dynamic,
                    dominator: dom,
                });
                Ok(CodeNode::Leaf)
            }
            TypeNode::List(elem) => {
                let elem_decl = match elem.as_ref() {
                    TypeNode::Prim(p) => ElemDecl::Prim(*p),
                    TypeNode::Enum { enumerators } => ElemDecl::Enum {
                        enumerators: *enumerators,
                    },
                    TypeNode::Dynamic => ElemDecl::Dynamic,
                    structured @ (TypeNode::Tuple(_) | TypeNode::Variant(_) | TypeNode::List(_)) => {
                        ElemDecl::Part(Schema::new(structured.clone())?)
                    }
                };
                let box_field = self.fields.len();
                let is_box = matches!(elem.as_ref(), TypeNode::Variant(_));
                self.fields.push(FieldDecl {
                    ty: FieldTy::List(elem_decl.clone()),
                    dominator: dom,
                });
                // A variant under a list is boxed: its sub-schema accessors
                // are re-exported in this schema's boxed range, element-wise.
                if is_box {
                    if let ElemDecl::Part(sub) = &elem_decl {
                        for inner in 0..sub.accessor_limit() {
                            self.boxed.push(BoxedDecl { box_field, inner });
                        }
                    }
                }
                Ok(CodeNode::Leaf)
            }
            TypeNode::Variant(cases) => {
                if cases.is_empty() {
                    return Err(CodecError::SchemaViolation(
                        "variant with no cases admits no layout".to_string(),
                    ));
                }
                let index = self.variants.len();
                self.variants.push(VariantDecl {
                    cases: cases.len(),
                    case_counts: Vec::new(),
                    total: BigUint::from(0u32),
                    dominator: dom,
                });
                let mut kids = Vec::with_capacity(cases.len());
                let mut counts = Vec::with_capacity(cases.len());
                for (ci, case) in cases.iter().enumerate() {
                    let kid = self.compile(case, Some((index, ci)))?;
                    counts.push(kid.count(&self.variants));
                    kids.push(kid);
                }
                let total: BigUint = counts.iter().sum();
                self.variants[index].case_counts = counts;
                self.variants[index].total = total;
                Ok(CodeNode::Variant { index, cases: kids })
            }
        }
    }
}

fn structural_id(root: &TypeNode) -> u64 {
    let mut hasher = FxHasher::default();
    hash_node(root, &mut hasher);
    hasher.finish()
}

fn hash_node(node: &TypeNode, hasher: &mut FxHasher) {
    match node {
        TypeNode::Tuple(members) => {
            hasher.write_u8(0x01);
            hasher.write_u32(members.len() as u32);
            for member in members {
                hash_node(member, hasher);
            }
        }
        TypeNode::Variant(cases) => {
            hasher.write_u8(0x02);
            hasher.write_u32(cases.len() as u32);
            for case in cases {
                hash_node(case, hasher);
            }
        }
        TypeNode::List(elem) => {
            hasher.write_u8(0x03);
            hash_node(elem, hasher);
        }
        TypeNode::Prim(p) => {
            hasher.write_u8(0x10);
            hasher.write_u8(p.type_code());
        }
        TypeNode::Enum { enumerators } => {
            hasher.write_u8(0x04);
            hasher.write_u32(*enumerators);
        }
        TypeNode::Dynamic => {
            hasher.write_u8(0x05);
        }
    }
}

/// Resolves schema ids embedded in dynamic fields back to schemas.
///
/// The codec core keeps no registry of its own; callers supply whatever
/// lookup they maintain. An unresolvable id surfaces as
/// [`CodecError::ModelNotImplemented`] when the dynamic content is
/// actually accessed, not at decode time.
pub trait SchemaResolver: Send + Sync {
    fn resolve(&self, id: u64) -> Option<Arc<Schema>>;
}

/// Minimal resolver over a fixed set of schemas.
#[derive(Default)]
pub struct SchemaSet {
    by_id: rustc_hash::FxHashMap<u64, Arc<Schema>>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: Arc<Schema>) {
        self.by_id.insert(schema.id(), schema);
    }
}

impl SchemaResolver for SchemaSet {
    fn resolve(&self, id: u64) -> Option<Arc<Schema>> {
        self.by_id.get(&id).cloned()
    }
}
