//! Compatibility maps: accessor translation between two schemas.
//!
//! Two schemas are compatible when one is a prefix-extension of the
//! other under the droppable-variant convention: any field present on
//! only one side must be a two-case variant with an empty-tuple case, so
//! it can be defaulted away. Compatible schemas number their accessors
//! differently, and a [`CompatibilityMap`] records the translation: one
//! entry per access-schema accessor naming its encoding-schema
//! counterpart (`-1` where there is none), plus per-variant case remap
//! tables for variants whose case counts differ.
//!
//! Building a map walks both type trees in lockstep, mirroring the
//! accessor numbering the schema compiler assigns, so the map never has
//! to be consulted during normal single-schema operation.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use weft_schema::{CodecError, Result, Schema, TypeNode};
use weft_wire as wire;

/// Accessor translation from an access schema onto an encoding schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityMap {
    access_schema_id: u64,
    /// Per access accessor: the encoding accessor, or `-1`.
    indices: Vec<i32>,
    /// First variant accessor of the encoding schema.
    var_bias: u16,
    /// Per encoding variant: access case -> encoding case, `None` when
    /// the counts match (identity) or the variant has no counterpart.
    set_cases: Vec<Option<Vec<i32>>>,
    /// Per encoding variant: encoding case -> access case.
    get_cases: Vec<Option<Vec<i32>>>,
}

impl CompatibilityMap {
    pub fn access_schema_id(&self) -> u64 {
        self.access_schema_id
    }

    /// Encoding accessor behind an access accessor; `None` out of range,
    /// `Some(-1)` for a deleted one.
    pub fn index(&self, accessor: usize) -> Option<i32> {
        self.indices.get(accessor).copied()
    }

    pub fn accessor_count(&self) -> usize {
        self.indices.len()
    }

    /// Translate a case read off the encoding node into the access
    /// schema's numbering. `encoding_accessor` must be a variant
    /// accessor of the encoding schema.
    pub fn translate_case_out(&self, encoding_accessor: usize, case: i32) -> i32 {
        let variant = encoding_accessor.wrapping_sub(self.var_bias as usize);
        match self.get_cases.get(variant) {
            Some(Some(table)) => table.get(case as usize).copied().unwrap_or(-1),
            _ => case,
        }
    }

    /// Translate an access-schema case into the encoding schema's
    /// numbering before a write.
    pub fn translate_case_in(&self, encoding_accessor: usize, case: i32) -> i32 {
        let variant = encoding_accessor.wrapping_sub(self.var_bias as usize);
        match self.set_cases.get(variant) {
            Some(Some(table)) => table.get(case as usize).copied().unwrap_or(-1),
            _ => case,
        }
    }

    /// Build the map from access-schema numbering onto `encoding`.
    pub fn build(access: &Arc<Schema>, encoding: &Arc<Schema>) -> Result<Arc<CompatibilityMap>> {
        let mut builder = Builder {
            access,
            encoding,
            indices: vec![-1; access.accessor_limit()],
            set_cases: vec![None; encoding.variant_count()],
            get_cases: vec![None; encoding.variant_count()],
        };
        let mut ac = Cursor::default();
        let mut ec = Cursor::default();
        builder.unify(access.root(), encoding.root(), &mut ac, &mut ec)?;
        Ok(Arc::new(CompatibilityMap {
            access_schema_id: access.id(),
            indices: builder.indices,
            var_bias: encoding.field_count() as u16,
            set_cases: builder.set_cases,
            get_cases: builder.get_cases,
        }))
    }

    /// Serialize to the interchange form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 2 * self.indices.len());
        out.extend_from_slice(&self.access_schema_id.to_be_bytes());
        out.extend_from_slice(&(self.indices.len() as u16).to_be_bytes());
        for index in &self.indices {
            out.extend_from_slice(&to_u16(*index).to_be_bytes());
        }
        out.extend_from_slice(&self.var_bias.to_be_bytes());
        encode_case_section(&mut out, &self.set_cases);
        encode_case_section(&mut out, &self.get_cases);
        out
    }

    /// Decode the interchange form.
    pub fn decode(bytes: &[u8]) -> Result<CompatibilityMap> {
        let access_schema_id = wire::read_u64(bytes, 0)?;
        let count = wire::read_u16(bytes, 8)? as usize;
        let mut indices = Vec::with_capacity(count);
        let mut at = 10;
        for _ in 0..count {
            indices.push(from_u16(wire::read_u16(bytes, at)?));
            at += 2;
        }
        let var_bias = wire::read_u16(bytes, at)?;
        at += 2;
        let (set_cases, used) = decode_case_section(bytes, at)?;
        at += used;
        let (get_cases, used) = decode_case_section(bytes, at)?;
        at += used;
        if at != bytes.len() {
            return Err(CodecError::MessageCorruption(
                "trailing bytes after compatibility map".to_string(),
            ));
        }
        Ok(CompatibilityMap {
            access_schema_id,
            indices,
            var_bias,
            set_cases,
            get_cases,
        })
    }
}

fn to_u16(value: i32) -> u16 {
    if value < 0 {
        0xFFFF
    } else {
        value as u16
    }
}

fn from_u16(raw: u16) -> i32 {
    if raw == 0xFFFF {
        -1
    } else {
        i32::from(raw)
    }
}

fn encode_case_section(out: &mut Vec<u8>, tables: &[Option<Vec<i32>>]) {
    out.extend_from_slice(&(tables.len() as u16).to_be_bytes());
    for table in tables {
        match table {
            None => out.extend_from_slice(&0xFFFFu16.to_be_bytes()),
            Some(cases) => {
                out.extend_from_slice(&(cases.len() as u16).to_be_bytes());
                for case in cases {
                    out.extend_from_slice(&to_u16(*case).to_be_bytes());
                }
            }
        }
    }
}

fn decode_case_section(bytes: &[u8], start: usize) -> Result<(Vec<Option<Vec<i32>>>, usize)> {
    let outer = wire::read_u16(bytes, start)? as usize;
    let mut tables = Vec::with_capacity(outer.min(1024));
    let mut at = start + 2;
    for _ in 0..outer {
        let len = wire::read_u16(bytes, at)?;
        at += 2;
        if len == 0xFFFF {
            tables.push(None);
            continue;
        }
        let mut cases = Vec::with_capacity(len as usize);
        for _ in 0..len {
            cases.push(from_u16(wire::read_u16(bytes, at)?));
            at += 2;
        }
        tables.push(Some(cases));
    }
    Ok((tables, at - start))
}

/// Accessor counters for one side of the lockstep walk, mirroring the
/// order the schema compiler numbers fields, variants, and boxed pairs.
#[derive(Default, Clone, Copy)]
struct Cursor {
    field: usize,
    variant: usize,
    boxed: usize,
}

/// (fields, variants, boxed) accessor span of a subtree.
fn accessor_span(node: &TypeNode) -> Result<(usize, usize, usize)> {
    match node {
        TypeNode::Tuple(members) => {
            let mut span = (0, 0, 0);
            for member in members {
                let (f, v, b) = accessor_span(member)?;
                span = (span.0 + f, span.1 + v, span.2 + b);
            }
            Ok(span)
        }
        TypeNode::Prim(_) | TypeNode::Enum { .. } | TypeNode::Dynamic => Ok((1, 0, 0)),
        TypeNode::List(elem) => {
            let boxed = if matches!(elem.as_ref(), TypeNode::Variant(_)) {
                let (f, v, b) = accessor_span(elem)?;
                f + v + b
            } else {
                0
            };
            Ok((1, 0, boxed))
        }
        TypeNode::Variant(cases) => {
            if cases.is_empty() {
                return Err(CodecError::SchemaViolation(
                    "variant with no cases admits no layout".to_string(),
                ));
            }
            let mut span = (0, 1, 0);
            for case in cases {
                let (f, v, b) = accessor_span(case)?;
                span = (span.0 + f, span.1 + v, span.2 + b);
            }
            Ok(span)
        }
    }
}

fn skip(cursor: &mut Cursor, node: &TypeNode) -> Result<()> {
    let (f, v, b) = accessor_span(node)?;
    cursor.field += f;
    cursor.variant += v;
    cursor.boxed += b;
    Ok(())
}

/// A field one side may lack: a two-case variant with an empty-tuple
/// case, so defaulting it drops the field.
fn is_droppable(node: &TypeNode) -> bool {
    matches!(node, TypeNode::Variant(cases)
        if cases.len() == 2 && (cases[0].is_empty_tuple() || cases[1].is_empty_tuple()))
}

fn mismatch(access: &TypeNode, encoding: &TypeNode) -> CodecError {
    CodecError::SchemaViolation(format!(
        "incompatible schemas: {access:?} does not translate onto {encoding:?}"
    ))
}

struct Builder<'s> {
    access: &'s Arc<Schema>,
    encoding: &'s Arc<Schema>,
    indices: Vec<i32>,
    set_cases: Vec<Option<Vec<i32>>>,
    get_cases: Vec<Option<Vec<i32>>>,
}

impl Builder<'_> {
    fn map_field(&mut self, ac: &mut Cursor, ec: &mut Cursor) {
        self.indices[ac.field] = ec.field as i32;
        ac.field += 1;
        ec.field += 1;
    }

    fn unify(
        &mut self,
        access: &TypeNode,
        encoding: &TypeNode,
        ac: &mut Cursor,
        ec: &mut Cursor,
    ) -> Result<()> {
        match (access, encoding) {
            (TypeNode::Tuple(am), TypeNode::Tuple(em)) => {
                let shared = am.len().min(em.len());
                for (a, e) in am[..shared].iter().zip(&em[..shared]) {
                    self.unify(a, e, ac, ec)?;
                }
                // Extra fields on either side must be droppable; access
                // extras stay mapped to -1, encoding extras are skipped.
                for extra in &am[shared..] {
                    if !is_droppable(extra) {
                        return Err(mismatch(access, encoding));
                    }
                    skip(ac, extra)?;
                }
                for extra in &em[shared..] {
                    if !is_droppable(extra) {
                        return Err(mismatch(access, encoding));
                    }
                    skip(ec, extra)?;
                }
                Ok(())
            }
            (TypeNode::Prim(a), TypeNode::Prim(e)) => {
                if a.type_code() != e.type_code() {
                    return Err(mismatch(access, encoding));
                }
                self.map_field(ac, ec);
                Ok(())
            }
            (
                TypeNode::Enum { enumerators: a },
                TypeNode::Enum { enumerators: e },
            ) => {
                if a != e {
                    return Err(mismatch(access, encoding));
                }
                self.map_field(ac, ec);
                Ok(())
            }
            (TypeNode::Dynamic, TypeNode::Dynamic) => {
                self.map_field(ac, ec);
                Ok(())
            }
            (TypeNode::List(ae), TypeNode::List(ee)) => self.unify_lists(ae, ee, ac, ec),
            (TypeNode::Variant(am), TypeNode::Variant(em)) => {
                self.unify_variants(access, encoding, am, em, ac, ec)
            }
            // One side optional (droppable), the other plain: the
            // variant's populated case carries the field.
            (TypeNode::Variant(am), _) => {
                if !is_droppable(access) {
                    return Err(mismatch(access, encoding));
                }
                self.indices[self.access.field_count() + ac.variant] = -1;
                ac.variant += 1;
                let (populated, empty) = droppable_split(am);
                self.unify(populated, encoding, ac, ec)?;
                skip(ac, empty)?;
                Ok(())
            }
            (_, TypeNode::Variant(em)) => {
                if !is_droppable(encoding) {
                    return Err(mismatch(access, encoding));
                }
                ec.variant += 1;
                let (populated, empty) = droppable_split(em);
                self.unify(access, populated, ac, ec)?;
                skip(ec, empty)?;
                Ok(())
            }
            _ => Err(mismatch(access, encoding)),
        }
    }

    fn unify_lists(
        &mut self,
        ae: &TypeNode,
        ee: &TypeNode,
        ac: &mut Cursor,
        ec: &mut Cursor,
    ) -> Result<()> {
        match (ae, ee) {
            (TypeNode::Variant(_), TypeNode::Variant(_)) => {
                // Boxed elements: translate the sub-schemas and lift the
                // element accessors into the boxed ranges.
                let sub_access = Schema::new(ae.clone())?;
                let sub_encoding = Schema::new(ee.clone())?;
                let sub = CompatibilityMap::build(&sub_access, &sub_encoding)?;
                // Case remaps below a box have no per-element home in
                // this map; only count-preserving elements translate.
                if sub.set_cases.iter().any(Option::is_some) {
                    return Err(CodecError::SchemaViolation(
                        "boxed variant elements must keep their case counts".to_string(),
                    ));
                }
                let a_base = self.access.first_boxed() + ac.boxed;
                let e_base = self.encoding.first_boxed() + ec.boxed;
                for (inner, mapped) in sub.indices.iter().enumerate() {
                    self.indices[a_base + inner] = if *mapped < 0 {
                        -1
                    } else {
                        (e_base + *mapped as usize) as i32
                    };
                }
                ac.boxed += sub_access.accessor_limit();
                ec.boxed += sub_encoding.accessor_limit();
                self.map_field(ac, ec);
                Ok(())
            }
            (TypeNode::Variant(_), _) | (_, TypeNode::Variant(_)) => Err(mismatch(ae, ee)),
            _ => {
                // Element trees must translate; their accessors live in
                // the element schemas, so only the list field maps here.
                let sub_access = Schema::new(ae.clone())?;
                let sub_encoding = Schema::new(ee.clone())?;
                CompatibilityMap::build(&sub_access, &sub_encoding)?;
                self.map_field(ac, ec);
                Ok(())
            }
        }
    }

    fn unify_variants(
        &mut self,
        access: &TypeNode,
        encoding: &TypeNode,
        am: &[TypeNode],
        em: &[TypeNode],
        ac: &mut Cursor,
        ec: &mut Cursor,
    ) -> Result<()> {
        if am.is_empty() || em.is_empty() {
            return Err(mismatch(access, encoding));
        }
        let shared = am.len().min(em.len());
        if am.len() != em.len() {
            let shorter = if am.len() < em.len() { &am[0] } else { &em[0] };
            if !shorter.is_empty_tuple() {
                return Err(mismatch(access, encoding));
            }
        }
        let a_variant = ac.variant;
        let e_variant = ec.variant;
        self.indices[self.access.field_count() + a_variant] =
            (self.encoding.field_count() + e_variant) as i32;
        ac.variant += 1;
        ec.variant += 1;
        for (a, e) in am[..shared].iter().zip(&em[..shared]) {
            self.unify(a, e, ac, ec)?;
        }
        for extra in &am[shared..] {
            skip(ac, extra)?;
        }
        for extra in &em[shared..] {
            skip(ec, extra)?;
        }
        if am.len() != em.len() {
            self.set_cases[e_variant] = Some(
                (0..am.len())
                    .map(|c| if c < shared { c as i32 } else { -1 })
                    .collect(),
            );
            self.get_cases[e_variant] = Some(
                (0..em.len())
                    .map(|c| if c < shared { c as i32 } else { -1 })
                    .collect(),
            );
        }
        Ok(())
    }
}

/// Split a droppable variant into its populated and empty cases.
fn droppable_split(cases: &[TypeNode]) -> (&TypeNode, &TypeNode) {
    if cases[1].is_empty_tuple() {
        (&cases[0], &cases[1])
    } else {
        (&cases[1], &cases[0])
    }
}

/// Memoized maps keyed by (access schema id, encoding schema id).
#[derive(Default)]
pub struct CompatCache {
    inner: RwLock<FxHashMap<(u64, u64), Arc<CompatibilityMap>>>,
}

impl CompatCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_for(
        &self,
        access: &Arc<Schema>,
        encoding: &Arc<Schema>,
    ) -> Result<Arc<CompatibilityMap>> {
        let key = (access.id(), encoding.id());
        if let Some(found) = self.inner.read().get(&key) {
            return Ok(Arc::clone(found));
        }
        debug!(access = key.0, encoding = key.1, "compatibility map cache miss");
        let map = CompatibilityMap::build(access, encoding)?;
        self.inner.write().insert(key, Arc::clone(&map));
        Ok(map)
    }
}
