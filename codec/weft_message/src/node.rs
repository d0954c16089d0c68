//! The node state machine and its recursive operations.
//!
//! A message tree is one [`Node`] graph owned by a root (see `message`).
//! Every frame in a tree addresses the root's single backing buffer, so a
//! tree is assembled exactly where frames exist and unassembled elsewhere.
//! All operations recurse from the root under the tree's master lock; a
//! mutation that invalidates a child's embedded bytes unassembles each
//! ancestor on the way back up, which keeps frames and caches consistent
//! without per-node locks.
//!
//! Sharing is copy-on-write at two levels: the backing buffer
//! ([`CowBuf`]) is aliased across trees by `copy()` and broken before any
//! mutation, and each node's cache vector is an `Arc` whose first
//! mutation after a copy clones it.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use weft_layout::{Layout, LayoutCache};
use weft_schema::{CodecError, ElemDecl, FieldTy, Result, Schema, SchemaResolver};
use weft_wire as wire;

use crate::codec;
use crate::value::Value;

/// Breaking buffer sharing copies the bytes when the buffer is smaller
/// than this; larger buffers are unassembled instead.
pub(crate) const SHARE_COPY_LIMIT: usize = 4096;

fn internal(msg: &str) -> CodecError {
    CodecError::MessageCorruption(msg.to_string())
}

/// Per-operation context cloned out of the root.
pub(crate) struct Ctx {
    pub layouts: Arc<LayoutCache>,
    pub resolver: Option<Arc<dyn SchemaResolver>>,
}

/// Reference-counted backing buffer with explicit copy-on-write.
///
/// Only tree roots hold a `CowBuf`, so the strong count is exactly the
/// number of trees aliasing these bytes.
#[derive(Debug, Clone)]
pub(crate) struct CowBuf {
    bytes: Arc<Vec<u8>>,
}

impl CowBuf {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.bytes) > 1
    }

    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.bytes)
    }
}

/// One step of a handle's path from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Field(usize),
    Elem(usize),
}

#[derive(Clone)]
pub(crate) enum Node {
    Tuple(TupleNode),
    List(ListNode),
}

/// A message or part: fields laid out under a schema.
#[derive(Clone)]
pub(crate) struct TupleNode {
    pub schema: Arc<Schema>,
    /// Present iff assembled. Offsets address the tree root's buffer.
    pub frame: Option<Frame>,
    /// With a frame: the decoded layout. Without one: a half-assembled
    /// layout resolved during length computation, cleared on any shape
    /// change.
    pub layout: Option<Arc<Layout>>,
    /// Choice cache, one case per variant, `-1` unset.
    pub choices: SmallVec<[i32; 8]>,
    pub cache: Arc<Vec<CacheSlot>>,
}

/// A list of structured or dynamic elements. Primitive-element lists are
/// plain [`Value::List`]s and never build one of these.
#[derive(Clone)]
pub(crate) struct ListNode {
    pub elem: ElemDecl,
    pub cache: Arc<Vec<CacheSlot>>,
}

#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// Offset of the `u16` choice length within the root buffer.
    pub start: usize,
    pub len: usize,
    /// Offset of the field-data region.
    pub data_start: usize,
    /// Decoded offset table, relative to `data_start`.
    pub table: Vec<u32>,
}

#[derive(Clone)]
pub(crate) enum CacheSlot {
    Unpopulated,
    Null,
    Value(Value),
    Part(Node),
    /// Dynamic content whose schema id did not resolve; kept verbatim so
    /// the message still re-encodes, surfaced as `ModelNotImplemented`
    /// on access.
    Opaque { schema_id: u64, bytes: Vec<u8> },
}

impl TupleNode {
    pub fn empty(schema: Arc<Schema>) -> TupleNode {
        let choices = SmallVec::from_elem(-1, schema.variant_count());
        let cache = Arc::new(vec![CacheSlot::Unpopulated; schema.field_count()]);
        TupleNode {
            schema,
            frame: None,
            layout: None,
            choices,
            cache,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding

/// Decode a node body (`u16` choice length, choice bytes, offset table)
/// at `start..start+len` without touching the field data.
pub(crate) fn decode_body(
    schema: &Arc<Schema>,
    buf: &[u8],
    start: usize,
    len: usize,
    ctx: &Ctx,
) -> Result<TupleNode> {
    let end = start
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| internal("frame range past end of buffer"))?;
    let choice_len = wire::read_u16(buf, start)? as usize;
    let choice_end = start + 2 + choice_len;
    if choice_end > end {
        return Err(internal("choice bytes run past the frame"));
    }
    let code = weft_layout::code_from_bytes(&buf[start + 2..choice_end])?;
    let layout = ctx.layouts.layout_for(schema, &code)?;
    let slots = layout.offset_slots() as usize;
    let data_start = choice_end + 4 * slots;
    if data_start > end {
        return Err(internal("offset table runs past the frame"));
    }
    let mut table = Vec::with_capacity(slots);
    for i in 0..slots {
        table.push(wire::read_u32(buf, choice_end + 4 * i)?);
    }
    let choices = SmallVec::from_slice(layout.choices());
    let cache = Arc::new(vec![CacheSlot::Unpopulated; schema.field_count()]);
    Ok(TupleNode {
        schema: Arc::clone(schema),
        frame: Some(Frame {
            start,
            len,
            data_start,
            table,
        }),
        layout: Some(layout),
        choices,
        cache,
    })
}

fn decode_dynamic(buf: &[u8], off: usize, ctx: &Ctx) -> Result<CacheSlot> {
    let len = wire::read_u32(buf, off)?;
    if len == wire::NULL_LEN {
        return Ok(CacheSlot::Null);
    }
    let len = len as usize;
    if len < 8 {
        return Err(internal("dynamic payload shorter than its schema id"));
    }
    let schema_id = wire::read_u64(buf, off + 4)?;
    let body_start = off + 12;
    let body_len = len - 8;
    // Validate the range up front even when the body stays opaque.
    let body = wire::read_bytes(buf, body_start, body_len)?;
    match ctx.resolver.as_ref().and_then(|r| r.resolve(schema_id)) {
        Some(schema) => Ok(CacheSlot::Part(Node::Tuple(decode_body(
            &schema, buf, body_start, body_len, ctx,
        )?))),
        None => Ok(CacheSlot::Opaque {
            schema_id,
            bytes: body.to_vec(),
        }),
    }
}

fn decode_part_list(elem: &ElemDecl, buf: &[u8], off: usize, ctx: &Ctx) -> Result<CacheSlot> {
    let payload = wire::read_u32(buf, off)?;
    if payload == wire::NULL_LEN {
        return Ok(CacheSlot::Null);
    }
    let payload = payload as usize;
    if payload < 4 {
        return Err(internal("part list payload too short for its count"));
    }
    wire::read_bytes(buf, off + 4, payload)?;
    let end = off + 4 + payload;
    let count = wire::read_u32(buf, off + 4)? as usize;
    if count > (payload - 4) / 4 {
        return Err(internal("part list count exceeds its payload"));
    }
    let mut slots = Vec::with_capacity(count);
    let mut at = off + 8;
    for _ in 0..count {
        match elem {
            ElemDecl::Part(sub) => {
                let elem_len = wire::read_u32(buf, at)?;
                if elem_len == wire::NULL_LEN {
                    slots.push(CacheSlot::Null);
                    at += 4;
                } else {
                    let body = decode_body(sub, buf, at + 4, elem_len as usize, ctx)?;
                    slots.push(CacheSlot::Part(Node::Tuple(body)));
                    at += 4 + elem_len as usize;
                }
            }
            ElemDecl::Dynamic => {
                let elem_len = wire::read_u32(buf, at)?;
                let used = 4 + if elem_len == wire::NULL_LEN {
                    0
                } else {
                    elem_len as usize
                };
                slots.push(decode_dynamic(buf, at, ctx)?);
                at += used;
            }
            ElemDecl::Prim(_) | ElemDecl::Enum { .. } => {
                return Err(internal("primitive list decoded as parts"));
            }
        }
    }
    if at != end {
        return Err(internal("part list payload disagrees with its elements"));
    }
    Ok(CacheSlot::Part(Node::List(ListNode {
        elem: elem.clone(),
        cache: Arc::new(slots),
    })))
}

/// Decode one present field of an assembled node into its cache slot.
fn decode_field(t: &mut TupleNode, buf: &[u8], ctx: &Ctx, field: usize) -> Result<()> {
    let abs = {
        let frame = t
            .frame
            .as_ref()
            .ok_or_else(|| internal("field decode on an unassembled node"))?;
        let layout = t
            .layout
            .as_ref()
            .ok_or_else(|| internal("assembled node without a layout"))?;
        layout.field_offset(field, frame.data_start, &frame.table)?
    };
    let decl = &t.schema.fields()[field];
    let slot = match &decl.ty {
        FieldTy::Prim(_) | FieldTy::Enum { .. } => match decl.ty.fixed_len() {
            Some(_) => CacheSlot::Value(codec::decode_fixed(&decl.ty, buf, abs)?),
            None => match codec::read_varying(&decl.ty, buf, abs)? {
                Value::Null => CacheSlot::Null,
                value => CacheSlot::Value(value),
            },
        },
        FieldTy::List(elem) => match elem {
            ElemDecl::Prim(_) | ElemDecl::Enum { .. } => {
                match codec::read_varying(&decl.ty, buf, abs)? {
                    Value::Null => CacheSlot::Null,
                    value => CacheSlot::Value(value),
                }
            }
            ElemDecl::Part(_) | ElemDecl::Dynamic => decode_part_list(elem, buf, abs, ctx)?,
        },
        FieldTy::Dynamic => decode_dynamic(buf, abs, ctx)?,
    };
    Arc::make_mut(&mut t.cache)[field] = slot;
    Ok(())
}

// ---------------------------------------------------------------------------
// Navigation

/// Descend one step, materializing the child from the frame if needed.
fn child_mut<'n>(
    node: &'n mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    step: Step,
) -> Result<&'n mut Node> {
    match (node, step) {
        (Node::Tuple(t), Step::Field(field)) => {
            if field >= t.schema.field_count() {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {field} is not a field"
                )));
            }
            if matches!(t.cache[field], CacheSlot::Unpopulated) && t.frame.is_some() {
                let present = t
                    .layout
                    .as_ref()
                    .is_some_and(|layout| layout.is_present(field));
                if present {
                    let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
                    decode_field(t, bytes, ctx, field)?;
                }
            }
            match &mut Arc::make_mut(&mut t.cache)[field] {
                CacheSlot::Part(child) => Ok(child),
                CacheSlot::Opaque { schema_id, .. } => {
                    Err(CodecError::ModelNotImplemented(*schema_id))
                }
                CacheSlot::Null => Err(CodecError::UninitializedAccess(format!(
                    "field {field} holds a null part"
                ))),
                CacheSlot::Value(_) => Err(CodecError::SchemaViolation(format!(
                    "field {field} is not a nested part"
                ))),
                CacheSlot::Unpopulated => Err(CodecError::UninitializedAccess(format!(
                    "part field {field} is not initialized"
                ))),
            }
        }
        (Node::List(l), Step::Elem(index)) => {
            if index >= l.cache.len() {
                return Err(CodecError::SchemaViolation(format!(
                    "list element {index} out of range ({} elements)",
                    l.cache.len()
                )));
            }
            match &mut Arc::make_mut(&mut l.cache)[index] {
                CacheSlot::Part(child) => Ok(child),
                CacheSlot::Opaque { schema_id, .. } => {
                    Err(CodecError::ModelNotImplemented(*schema_id))
                }
                CacheSlot::Null => Err(CodecError::UninitializedAccess(format!(
                    "list element {index} is null"
                ))),
                _ => Err(CodecError::UninitializedAccess(format!(
                    "list element {index} is not initialized"
                ))),
            }
        }
        _ => Err(CodecError::SchemaViolation(
            "part path does not match the node shape".to_string(),
        )),
    }
}

/// Walk a handle path down from the root.
pub(crate) fn navigate<'n>(
    node: &'n mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    path: &[Step],
) -> Result<&'n mut Node> {
    let mut cur = node;
    for step in path {
        cur = child_mut(cur, buf, ctx, *step)?;
    }
    Ok(cur)
}

/// Run a mutating operation at the end of `path`. The operation reports
/// whether it dirtied the node (dropped its frame or changed its encoded
/// size); every assembled ancestor on the unwind then unassembles, since
/// its frame embeds the child's now-stale bytes.
pub(crate) fn mutate_at<R>(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    ctx: &Ctx,
    path: &[Step],
    at_root: bool,
    op: &mut dyn FnMut(&mut Node, &mut Option<CowBuf>, bool, &Ctx) -> Result<(R, bool)>,
) -> Result<(R, bool)> {
    let Some((step, rest)) = path.split_first() else {
        return op(node, buf, at_root, ctx);
    };
    let child = {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        child_mut(node, slice, ctx, *step)?
    };
    let (result, child_dirty) = mutate_at(child, buf, ctx, rest, false, op)?;
    if child_dirty {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        unassemble_shallow(node, slice, ctx)?;
    }
    Ok((result, child_dirty))
}

// ---------------------------------------------------------------------------
// Unassembly

/// Pull every present field of this node into its cache, then drop the
/// frame and layout. Children materialized here stay assembled against
/// the root buffer. Idempotent.
pub(crate) fn unassemble_shallow(node: &mut Node, buf: Option<&[u8]>, ctx: &Ctx) -> Result<()> {
    let Node::Tuple(t) = node else {
        return Ok(());
    };
    if t.frame.is_none() {
        // Half-assembled state dissolves back to unassembled.
        t.layout = None;
        return Ok(());
    }
    for field in 0..t.schema.field_count() {
        let present = t
            .layout
            .as_ref()
            .is_some_and(|layout| layout.is_present(field));
        if present && matches!(t.cache[field], CacheSlot::Unpopulated) {
            let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
            decode_field(t, bytes, ctx, field)?;
        }
    }
    debug!(schema = t.schema.id(), "unassembling node");
    t.frame = None;
    t.layout = None;
    Ok(())
}

/// Unassemble this node and every part beneath it. Opaque dynamic
/// content stays as bytes. After this the subtree holds no frames.
pub(crate) fn unassemble_deep(node: &mut Node, buf: Option<&[u8]>, ctx: &Ctx) -> Result<()> {
    unassemble_shallow(node, buf, ctx)?;
    let cache = match node {
        Node::Tuple(t) => &mut t.cache,
        Node::List(l) => &mut l.cache,
    };
    for slot in Arc::make_mut(cache).iter_mut() {
        if let CacheSlot::Part(child) = slot {
            unassemble_deep(child, buf, ctx)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads

/// Read a field value, decoding it from the frame on first access.
pub(crate) fn read_field(
    node: &mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    field: usize,
) -> Result<Value> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "value read on a list node".to_string(),
        ));
    };
    if field >= t.schema.field_count() {
        return Err(CodecError::SchemaViolation(format!(
            "accessor {field} is not a field"
        )));
    }
    if matches!(t.cache[field], CacheSlot::Unpopulated) && t.frame.is_some() {
        let present = t
            .layout
            .as_ref()
            .is_some_and(|layout| layout.is_present(field));
        if present {
            let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
            decode_field(t, bytes, ctx, field)?;
        }
    }
    match &t.cache[field] {
        CacheSlot::Value(value) => Ok(value.clone()),
        CacheSlot::Null => Ok(Value::Null),
        CacheSlot::Part(_) => Err(CodecError::SchemaViolation(format!(
            "field {field} is a nested part; use a part handle"
        ))),
        CacheSlot::Opaque { schema_id, .. } => Err(CodecError::ModelNotImplemented(*schema_id)),
        CacheSlot::Unpopulated => Err(CodecError::UninitializedAccess(format!(
            "field {field} is not set"
        ))),
    }
}

/// Read a variant's recorded case.
pub(crate) fn read_case(node: &Node, variant: usize) -> Result<i32> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "case read on a list node".to_string(),
        ));
    };
    if variant >= t.schema.variant_count() {
        return Err(CodecError::SchemaViolation(format!(
            "variant {variant} out of range"
        )));
    }
    let case = t.choices[variant];
    if case < 0 {
        return Err(CodecError::UninitializedAccess(format!(
            "variant {variant} has no case chosen"
        )));
    }
    Ok(case)
}

/// Structural presence of a field under the node's current shape.
pub(crate) fn field_present(node: &Node, field: usize) -> Result<bool> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "presence check on a list node".to_string(),
        ));
    };
    if field >= t.schema.field_count() {
        return Err(CodecError::SchemaViolation(format!(
            "accessor {field} is not a field"
        )));
    }
    match &t.layout {
        Some(layout) => Ok(layout.is_present(field)),
        None => Ok(t.schema.field_consistent(&t.choices, field)),
    }
}

// ---------------------------------------------------------------------------
// Mutations

fn set_slot(t: &mut TupleNode, field: usize, value: &Value) {
    Arc::make_mut(&mut t.cache)[field] = if value.is_null() {
        CacheSlot::Null
    } else {
        CacheSlot::Value(value.clone())
    };
}

fn nearest_choice_ok(t: &TupleNode, variant: usize) -> bool {
    match t.schema.variants()[variant].dominator {
        Some((dv, dc)) => t.choices[dv] == dc as i32,
        None => true,
    }
}

/// Drop choices and cache entries made inconsistent by a choice change.
/// Variants are declared dominator-first, so one forward pass memoizes
/// inconsistency (`-1`) before dependents are checked.
fn invalidate_inconsistent(t: &mut TupleNode) {
    for variant in 0..t.schema.variant_count() {
        if t.choices[variant] >= 0 && !nearest_choice_ok(t, variant) {
            t.choices[variant] = -1;
        }
    }
    for field in 0..t.schema.field_count() {
        if !matches!(t.cache[field], CacheSlot::Unpopulated)
            && !t.schema.field_consistent(&t.choices, field)
        {
            Arc::make_mut(&mut t.cache)[field] = CacheSlot::Unpopulated;
        }
    }
}

/// Record a case and force every dominating variant to the case that
/// makes it reachable, then invalidate whatever the change orphaned.
fn apply_case(t: &mut TupleNode, variant: usize, case: i32) {
    t.choices[variant] = case;
    let mut dom = t.schema.variants()[variant].dominator;
    while let Some((dv, dc)) = dom {
        t.choices[dv] = dc as i32;
        dom = t.schema.variants()[dv].dominator;
    }
    invalidate_inconsistent(t);
}

fn force_reachable(t: &mut TupleNode, dominator: Option<(usize, usize)>) {
    if let Some((dv, dc)) = dominator {
        apply_case(t, dv, dc as i32);
    }
}

/// Set a field value. Returns whether the node was dirtied.
pub(crate) fn op_set_field(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    at_root: bool,
    ctx: &Ctx,
    field: usize,
    value: &Value,
) -> Result<bool> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "value write on a list node".to_string(),
        ));
    };
    if field >= t.schema.field_count() {
        return Err(CodecError::SchemaViolation(format!(
            "accessor {field} is not a field"
        )));
    }
    let decl = t.schema.fields()[field].clone();
    codec::validate(&decl.ty, value)?;
    match &t.cache[field] {
        CacheSlot::Value(old) if old == value => return Ok(false),
        CacheSlot::Null if value.is_null() => return Ok(false),
        _ => {}
    }

    if t.frame.is_some() {
        let layout = t
            .layout
            .clone()
            .ok_or_else(|| internal("assembled node without a layout"))?;
        if layout.is_present(field) {
            let abs = {
                let frame = t
                    .frame
                    .as_ref()
                    .ok_or_else(|| internal("frame vanished mid-write"))?;
                layout.field_offset(field, frame.data_start, &frame.table)?
            };
            if decl.ty.fixed_len().is_some() {
                let backing = buf
                    .as_mut()
                    .ok_or_else(|| internal("assembled tree without a buffer"))?;
                codec::encode_fixed(backing.make_mut(), abs, value)?;
                set_slot(t, field, value);
                return Ok(false);
            }
            let old_total = {
                let bytes = buf
                    .as_ref()
                    .ok_or_else(|| internal("assembled tree without a buffer"))?
                    .as_slice();
                let old = wire::read_u32(bytes, abs)?;
                4 + if old == wire::NULL_LEN { 0 } else { old as usize }
            };
            let new_total = if value.is_null() {
                4
            } else {
                4 + codec::payload_len(&decl.ty, value)?
            };
            if new_total == old_total {
                let backing = buf
                    .as_mut()
                    .ok_or_else(|| internal("assembled tree without a buffer"))?;
                codec::write_varying(&decl.ty, backing.make_mut(), abs, value)?;
                set_slot(t, field, value);
                return Ok(false);
            }
            if at_root {
                splice_root(t, buf, abs, old_total, new_total, &decl.ty, value)?;
                set_slot(t, field, value);
                return Ok(false);
            }
            // Embedded in an ancestor's buffer; cannot be spliced here.
            let slice = buf.as_ref().map(CowBuf::as_slice);
            unassemble_tuple(t, slice, ctx)?;
            set_slot(t, field, value);
            return Ok(true);
        }
        // Absent under the current shape: the write changes the shape.
        let slice = buf.as_ref().map(CowBuf::as_slice);
        unassemble_tuple(t, slice, ctx)?;
        force_reachable(t, decl.dominator);
        set_slot(t, field, value);
        return Ok(true);
    }

    t.layout = None;
    if !t.schema.field_consistent(&t.choices, field) {
        force_reachable(t, decl.dominator);
    }
    set_slot(t, field, value);
    Ok(false)
}

fn unassemble_tuple(t: &mut TupleNode, buf: Option<&[u8]>, ctx: &Ctx) -> Result<()> {
    // Wrap to reuse the Node-level routine.
    for field in 0..t.schema.field_count() {
        let present = t
            .layout
            .as_ref()
            .is_some_and(|layout| layout.is_present(field));
        if present && matches!(t.cache[field], CacheSlot::Unpopulated) {
            let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
            decode_field(t, bytes, ctx, field)?;
        }
    }
    if t.frame.is_some() {
        debug!(schema = t.schema.id(), "unassembling node");
    }
    t.frame = None;
    t.layout = None;
    Ok(())
}

/// Resize a varying field in the root's buffer in place: splice the
/// bytes, shift later offset-table entries by the delta, and rebase
/// every descendant frame past the splice point.
fn splice_root(
    t: &mut TupleNode,
    buf: &mut Option<CowBuf>,
    abs: usize,
    old_total: usize,
    new_total: usize,
    ty: &FieldTy,
    value: &Value,
) -> Result<()> {
    let delta = new_total as isize - old_total as isize;
    debug!(delta, "splicing root buffer");
    let backing = buf
        .as_mut()
        .ok_or_else(|| internal("assembled tree without a buffer"))?;
    let bytes = backing.make_mut();
    if new_total > old_total {
        let grow = new_total - old_total;
        bytes.splice(abs..abs, std::iter::repeat(0u8).take(grow));
    } else {
        bytes.drain(abs..abs + (old_total - new_total));
    }
    codec::write_varying(ty, bytes, abs, value)?;

    let frame = t
        .frame
        .as_mut()
        .ok_or_else(|| internal("splice on an unassembled node"))?;
    frame.len = (frame.len as isize + delta) as usize;
    let rel = (abs - frame.data_start) as u32;
    for entry in frame.table.iter_mut() {
        if *entry > rel {
            *entry = (*entry as isize + delta) as u32;
        }
    }
    let table_base = frame.data_start - 4 * frame.table.len();
    for (i, entry) in frame.table.iter().enumerate() {
        wire::write_u32(bytes, table_base + 4 * i, *entry)?;
    }

    for slot in Arc::make_mut(&mut t.cache).iter_mut() {
        if let CacheSlot::Part(child) = slot {
            rebase(child, abs, delta);
        }
    }
    Ok(())
}

/// Shift every frame at or past `from` by `delta` after a root splice.
fn rebase(node: &mut Node, from: usize, delta: isize) {
    let cache = match node {
        Node::Tuple(t) => {
            if let Some(frame) = &mut t.frame {
                if frame.start >= from {
                    frame.start = (frame.start as isize + delta) as usize;
                    frame.data_start = (frame.data_start as isize + delta) as usize;
                }
            }
            &mut t.cache
        }
        Node::List(l) => &mut l.cache,
    };
    for slot in Arc::make_mut(cache).iter_mut() {
        if let CacheSlot::Part(child) = slot {
            rebase(child, from, delta);
        }
    }
}

/// Record a variant case. Dirties the node when the shape changes under
/// an assembled frame.
pub(crate) fn op_set_case(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    ctx: &Ctx,
    variant: usize,
    case: i32,
) -> Result<bool> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "case write on a list node".to_string(),
        ));
    };
    if variant >= t.schema.variant_count() {
        return Err(CodecError::SchemaViolation(format!(
            "variant {variant} out of range"
        )));
    }
    let cases = t.schema.variants()[variant].cases;
    if case < 0 || case as usize >= cases {
        return Err(CodecError::SchemaViolation(format!(
            "case {case} out of range for variant {variant} ({cases} cases)"
        )));
    }
    if t.choices[variant] == case {
        return Ok(false);
    }
    if t.frame.is_some() {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        unassemble_tuple(t, slice, ctx)?;
        apply_case(t, variant, case);
        return Ok(true);
    }
    t.layout = None;
    apply_case(t, variant, case);
    Ok(false)
}

/// Install a fresh part list (box list) behind a structured list field.
pub(crate) fn op_create_list(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    ctx: &Ctx,
    field: usize,
    len: usize,
) -> Result<bool> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "list creation on a list node".to_string(),
        ));
    };
    if field >= t.schema.field_count() {
        return Err(CodecError::SchemaViolation(format!(
            "accessor {field} is not a field"
        )));
    }
    let decl = t.schema.fields()[field].clone();
    let elem = match &decl.ty {
        FieldTy::List(elem @ (ElemDecl::Part(_) | ElemDecl::Dynamic)) => elem.clone(),
        other => {
            return Err(CodecError::SchemaViolation(format!(
                "field {field} ({other:?}) does not hold structured elements"
            )))
        }
    };
    let was_assembled = t.frame.is_some();
    if was_assembled {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        unassemble_tuple(t, slice, ctx)?;
    } else {
        t.layout = None;
    }
    if !t.schema.field_consistent(&t.choices, field) {
        force_reachable(t, decl.dominator);
    }
    let slots = match &elem {
        ElemDecl::Part(sub) => {
            vec![CacheSlot::Part(Node::Tuple(TupleNode::empty(Arc::clone(sub)))); len]
        }
        _ => vec![CacheSlot::Unpopulated; len],
    };
    Arc::make_mut(&mut t.cache)[field] = CacheSlot::Part(Node::List(ListNode {
        elem,
        cache: Arc::new(slots),
    }));
    Ok(was_assembled)
}

/// Install a part node behind a dynamic field or dynamic list element.
pub(crate) fn op_install_part(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    ctx: &Ctx,
    step: Step,
    part: Node,
) -> Result<bool> {
    match (node, step) {
        (Node::Tuple(t), Step::Field(field)) => {
            if field >= t.schema.field_count() {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {field} is not a field"
                )));
            }
            let decl = t.schema.fields()[field].clone();
            if !matches!(decl.ty, FieldTy::Dynamic) {
                return Err(CodecError::SchemaViolation(format!(
                    "field {field} is not dynamic"
                )));
            }
            let was_assembled = t.frame.is_some();
            if was_assembled {
                let slice = buf.as_ref().map(CowBuf::as_slice);
                unassemble_tuple(t, slice, ctx)?;
            } else {
                t.layout = None;
            }
            if !t.schema.field_consistent(&t.choices, field) {
                force_reachable(t, decl.dominator);
            }
            Arc::make_mut(&mut t.cache)[field] = CacheSlot::Part(part);
            Ok(was_assembled)
        }
        (Node::List(l), Step::Elem(index)) => {
            if !matches!(l.elem, ElemDecl::Dynamic) {
                return Err(CodecError::SchemaViolation(
                    "element install on a non-dynamic list".to_string(),
                ));
            }
            if index >= l.cache.len() {
                return Err(CodecError::SchemaViolation(format!(
                    "list element {index} out of range ({} elements)",
                    l.cache.len()
                )));
            }
            Arc::make_mut(&mut l.cache)[index] = CacheSlot::Part(part);
            // The list holds no frame of its own, but the enclosing
            // tuple's bytes are now stale.
            Ok(true)
        }
        _ => Err(CodecError::SchemaViolation(
            "part install does not match the node shape".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Accessor dispatch

/// What an accessor number names on a given schema.
pub(crate) enum Target {
    Field(usize),
    Variant(usize),
    Boxed(weft_schema::BoxedDecl),
}

pub(crate) fn resolve_accessor(schema: &Schema, accessor: usize) -> Result<Target> {
    let nf = schema.field_count();
    if accessor < nf {
        return Ok(Target::Field(accessor));
    }
    if accessor < schema.first_boxed() {
        return Ok(Target::Variant(accessor - nf));
    }
    if accessor < schema.accessor_limit() {
        return Ok(Target::Boxed(schema.boxed()[accessor - schema.first_boxed()]));
    }
    Err(CodecError::SchemaViolation(format!(
        "accessor {accessor} out of range (< {})",
        schema.accessor_limit()
    )))
}

pub(crate) fn node_schema(node: &Node) -> Result<Arc<Schema>> {
    match node {
        Node::Tuple(t) => Ok(Arc::clone(&t.schema)),
        Node::List(_) => Err(CodecError::SchemaViolation(
            "handle names a list, not a message".to_string(),
        )),
    }
}

/// Element count of a structured or primitive list field.
pub(crate) fn read_list_len(
    node: &mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    field: usize,
) -> Result<usize> {
    let Node::Tuple(t) = node else {
        return Err(CodecError::SchemaViolation(
            "list length of a list node".to_string(),
        ));
    };
    if field >= t.schema.field_count() {
        return Err(CodecError::SchemaViolation(format!(
            "accessor {field} is not a field"
        )));
    }
    if matches!(t.cache[field], CacheSlot::Unpopulated) && t.frame.is_some() {
        let present = t
            .layout
            .as_ref()
            .is_some_and(|layout| layout.is_present(field));
        if present {
            let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
            decode_field(t, bytes, ctx, field)?;
        }
    }
    match &t.cache[field] {
        CacheSlot::Part(Node::List(l)) => Ok(l.cache.len()),
        CacheSlot::Value(Value::List(items)) => Ok(items.len()),
        CacheSlot::Null => Err(CodecError::UninitializedAccess(format!(
            "list field {field} is null"
        ))),
        CacheSlot::Opaque { schema_id, .. } => Err(CodecError::ModelNotImplemented(*schema_id)),
        CacheSlot::Part(_) | CacheSlot::Value(_) => Err(CodecError::SchemaViolation(format!(
            "field {field} is not a list"
        ))),
        CacheSlot::Unpopulated => Err(CodecError::UninitializedAccess(format!(
            "list field {field} is not set"
        ))),
    }
}

/// Read a boxed accessor: apply the inner accessor to every element of
/// the box list and gather the results.
pub(crate) fn boxed_read(
    node: &mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    boxed: weft_schema::BoxedDecl,
) -> Result<Value> {
    let len = {
        let list = child_mut(node, buf, ctx, Step::Field(boxed.box_field))?;
        match list {
            Node::List(l) => l.cache.len(),
            Node::Tuple(_) => return Err(internal("box field holds a tuple")),
        }
    };
    let mut out = Vec::with_capacity(len);
    for index in 0..len {
        let elem = {
            let list = child_mut(node, buf, ctx, Step::Field(boxed.box_field))?;
            child_mut(list, buf, ctx, Step::Elem(index))?
        };
        let schema = node_schema(elem)?;
        let value = match resolve_accessor(&schema, boxed.inner)? {
            Target::Field(f) => read_field(elem, buf, ctx, f)?,
            Target::Variant(v) => Value::I32(read_case(elem, v)?),
            Target::Boxed(nested) => boxed_read(elem, buf, ctx, nested)?,
        };
        out.push(value);
    }
    Ok(Value::List(out))
}

/// Write through a boxed accessor: one item per box-list element.
pub(crate) fn op_boxed_set(
    node: &mut Node,
    buf: &mut Option<CowBuf>,
    ctx: &Ctx,
    boxed: weft_schema::BoxedDecl,
    items: &[Value],
) -> Result<bool> {
    let len = {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        let list = child_mut(node, slice, ctx, Step::Field(boxed.box_field))?;
        match list {
            Node::List(l) => l.cache.len(),
            Node::Tuple(_) => return Err(internal("box field holds a tuple")),
        }
    };
    if items.len() != len {
        return Err(CodecError::SchemaViolation(format!(
            "boxed write carries {} items for {len} elements",
            items.len()
        )));
    }
    let mut dirty = false;
    for (index, item) in items.iter().enumerate() {
        let elem = {
            let slice = buf.as_ref().map(CowBuf::as_slice);
            let list = child_mut(node, slice, ctx, Step::Field(boxed.box_field))?;
            child_mut(list, slice, ctx, Step::Elem(index))?
        };
        let schema = node_schema(elem)?;
        let elem_dirty = match resolve_accessor(&schema, boxed.inner)? {
            Target::Field(f) => op_set_field(elem, buf, false, ctx, f, item)?,
            Target::Variant(v) => {
                let Value::I32(case) = item else {
                    return Err(CodecError::SchemaViolation(format!(
                        "{item:?} is not a case number"
                    )));
                };
                op_set_case(elem, buf, ctx, v, *case)?
            }
            Target::Boxed(nested) => {
                let Value::List(inner) = item else {
                    return Err(CodecError::SchemaViolation(format!(
                        "{item:?} is not a nested boxed list"
                    )));
                };
                op_boxed_set(elem, buf, ctx, nested, inner)?
            }
        };
        dirty = dirty || elem_dirty;
    }
    if dirty {
        let slice = buf.as_ref().map(CowBuf::as_slice);
        unassemble_shallow(node, slice, ctx)?;
    }
    Ok(dirty)
}

/// Carry cached leaf values across a reassembly install.
pub(crate) fn port_value_cache(old: &Node, fresh: &mut TupleNode) {
    if let Node::Tuple(t) = old {
        let cache = Arc::make_mut(&mut fresh.cache);
        for (slot, old_slot) in cache.iter_mut().zip(t.cache.iter()) {
            match old_slot {
                CacheSlot::Value(value) => *slot = CacheSlot::Value(value.clone()),
                CacheSlot::Null => *slot = CacheSlot::Null,
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sizing and assembly

fn list_wire_len(l: &mut ListNode, ctx: &Ctx) -> Result<usize> {
    let mut total = 4usize; // element count
    for index in 0..l.cache.len() {
        total += match &mut Arc::make_mut(&mut l.cache)[index] {
            CacheSlot::Null => 4,
            CacheSlot::Part(child) => match (&l.elem, &mut *child) {
                (ElemDecl::Dynamic, Node::Tuple(_)) => 4 + 8 + body_len(child, ctx)?,
                (ElemDecl::Part(_), Node::Tuple(_)) => 4 + body_len(child, ctx)?,
                _ => return Err(internal("list element shape mismatch")),
            },
            CacheSlot::Opaque { bytes, .. } => 4 + 8 + bytes.len(),
            CacheSlot::Unpopulated => {
                return Err(CodecError::UninitializedAccess(format!(
                    "list element {index} is not set"
                )))
            }
            CacheSlot::Value(_) => return Err(internal("value in a part list")),
        };
    }
    Ok(total)
}

fn field_len(t: &mut TupleNode, ctx: &Ctx, field: usize) -> Result<usize> {
    let decl = t.schema.fields()[field].clone();
    if let Some(width) = decl.ty.fixed_len() {
        if matches!(t.cache[field], CacheSlot::Unpopulated) {
            return Err(CodecError::UninitializedAccess(format!(
                "field {field} is not set"
            )));
        }
        return Ok(width as usize);
    }
    match &mut Arc::make_mut(&mut t.cache)[field] {
        CacheSlot::Null => Ok(4),
        CacheSlot::Value(value) => Ok(4 + codec::payload_len(&decl.ty, value)?),
        CacheSlot::Opaque { bytes, .. } => Ok(4 + 8 + bytes.len()),
        CacheSlot::Part(child) => match (&decl.ty, &mut *child) {
            (FieldTy::Dynamic, Node::Tuple(_)) => Ok(4 + 8 + body_len(child, ctx)?),
            (FieldTy::List(_), Node::List(l)) => Ok(4 + list_wire_len(l, ctx)?),
            _ => Err(internal("cached part shape disagrees with the field type")),
        },
        CacheSlot::Unpopulated => Err(CodecError::UninitializedAccess(format!(
            "field {field} is not set"
        ))),
    }
}

/// Encoded body length of a tuple node; resolves and pins the layout
/// (the half-assembled state) when the node has no frame.
pub(crate) fn body_len(node: &mut Node, ctx: &Ctx) -> Result<usize> {
    let Node::Tuple(t) = node else {
        return Err(internal("body length of a bare list node"));
    };
    if let Some(frame) = &t.frame {
        return Ok(frame.len);
    }
    let layout = match &t.layout {
        Some(layout) => Arc::clone(layout),
        None => {
            let layout = ctx.layouts.layout_for_choices(&t.schema, &t.choices)?;
            t.layout = Some(Arc::clone(&layout));
            layout
        }
    };
    let mut total = 2 + layout.code_bytes().len() + 4 * layout.offset_slots() as usize;
    for field in 0..t.schema.field_count() {
        if layout.is_present(field) {
            total += field_len(t, ctx, field)?;
        }
    }
    Ok(total)
}

fn write_list(l: &mut ListNode, src: Option<&[u8]>, ctx: &Ctx, out: &mut [u8], at: usize) -> Result<usize> {
    let payload = list_wire_len(l, ctx)?;
    wire::write_u32(out, at, payload as u32)?;
    wire::write_u32(out, at + 4, l.cache.len() as u32)?;
    let mut cur = at + 8;
    for index in 0..l.cache.len() {
        match &mut Arc::make_mut(&mut l.cache)[index] {
            CacheSlot::Null => {
                wire::write_u32(out, cur, wire::NULL_LEN)?;
                cur += 4;
            }
            CacheSlot::Opaque { schema_id, bytes } => {
                wire::write_u32(out, cur, (8 + bytes.len()) as u32)?;
                wire::write_u64(out, cur + 4, *schema_id)?;
                wire::write_bytes(out, cur + 12, bytes)?;
                cur += 12 + bytes.len();
            }
            CacheSlot::Part(child) => match &l.elem {
                ElemDecl::Dynamic => {
                    let body = body_len(child, ctx)?;
                    let Node::Tuple(part) = &*child else {
                        return Err(internal("list element shape mismatch"));
                    };
                    let id = part.schema.id();
                    wire::write_u32(out, cur, (8 + body) as u32)?;
                    wire::write_u64(out, cur + 4, id)?;
                    let written = write_body(child, src, ctx, out, cur + 12)?;
                    cur += 12 + written;
                }
                ElemDecl::Part(_) => {
                    let body = body_len(child, ctx)?;
                    wire::write_u32(out, cur, body as u32)?;
                    let written = write_body(child, src, ctx, out, cur + 4)?;
                    cur += 4 + written;
                }
                _ => return Err(internal("primitive list written as parts")),
            },
            _ => return Err(internal("unset element reached assembly")),
        }
    }
    Ok(4 + payload)
}

/// Serialize a tuple node body at `at`; returns the bytes written.
/// Assembled subtrees are copied verbatim from the source buffer.
fn write_body(
    node: &mut Node,
    src: Option<&[u8]>,
    ctx: &Ctx,
    out: &mut [u8],
    at: usize,
) -> Result<usize> {
    let Node::Tuple(t) = node else {
        return Err(internal("body write of a bare list node"));
    };
    if let Some(frame) = &t.frame {
        let bytes = src.ok_or_else(|| internal("assembled tree without a buffer"))?;
        let span = wire::read_bytes(bytes, frame.start, frame.len)?;
        wire::write_bytes(out, at, span)?;
        return Ok(frame.len);
    }
    let layout = match &t.layout {
        Some(layout) => Arc::clone(layout),
        None => {
            let layout = ctx.layouts.layout_for_choices(&t.schema, &t.choices)?;
            t.layout = Some(Arc::clone(&layout));
            layout
        }
    };
    let code = layout.code_bytes();
    wire::write_u16(out, at, code.len() as u16)?;
    wire::write_bytes(out, at + 2, code)?;
    let table_base = at + 2 + code.len();
    let data_at = table_base + 4 * layout.offset_slots() as usize;
    let mut cur = data_at;
    for field in 0..t.schema.field_count() {
        let Some(place) = layout.placement(field).copied() else {
            continue;
        };
        let decl = t.schema.fields()[field].clone();
        let used = if decl.ty.fixed_len().is_some() {
            match &t.cache[field] {
                CacheSlot::Value(value) => {
                    codec::encode_fixed(out, cur, value)?;
                    decl.ty.fixed_len().map(|w| w as usize).unwrap_or(0)
                }
                _ => {
                    return Err(CodecError::UninitializedAccess(format!(
                        "field {field} is not set"
                    )))
                }
            }
        } else {
            match &mut Arc::make_mut(&mut t.cache)[field] {
                CacheSlot::Null => {
                    wire::write_u32(out, cur, wire::NULL_LEN)?;
                    4
                }
                CacheSlot::Value(value) => codec::write_varying(&decl.ty, out, cur, value)?,
                CacheSlot::Opaque { schema_id, bytes } => {
                    wire::write_u32(out, cur, (8 + bytes.len()) as u32)?;
                    wire::write_u64(out, cur + 4, *schema_id)?;
                    wire::write_bytes(out, cur + 12, bytes)?;
                    12 + bytes.len()
                }
                CacheSlot::Part(child) => match (&decl.ty, &mut *child) {
                    (FieldTy::Dynamic, Node::Tuple(_)) => {
                        let body = body_len(child, ctx)?;
                        let Node::Tuple(part) = &*child else {
                            return Err(internal("part shape changed mid-write"));
                        };
                        let id = part.schema.id();
                        wire::write_u32(out, cur, (8 + body) as u32)?;
                        wire::write_u64(out, cur + 4, id)?;
                        let written = write_body(child, src, ctx, out, cur + 12)?;
                        12 + written
                    }
                    (FieldTy::List(_), Node::List(l)) => write_list(l, src, ctx, out, cur)?,
                    _ => return Err(internal("cached part shape disagrees with the field type")),
                },
                CacheSlot::Unpopulated => {
                    return Err(CodecError::UninitializedAccess(format!(
                        "field {field} is not set"
                    )))
                }
            }
        };
        cur += used;
        if let Some(slot) = place.varying_slot {
            wire::write_u32(out, table_base + 4 * slot as usize, (cur - data_at) as u32)?;
        }
    }
    Ok(cur - at)
}

/// Serialize a node body to fresh bytes. Assembled nodes byte-copy their
/// existing frame.
pub(crate) fn assemble(node: &mut Node, src: Option<&[u8]>, ctx: &Ctx) -> Result<Vec<u8>> {
    let total = body_len(node, ctx)?;
    let mut out = vec![0u8; total];
    let written = write_body(node, src, ctx, &mut out, 0)?;
    if written != total {
        return Err(internal("assembly length disagrees with its sizing pass"));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Schema discovery and sizing estimates

/// Collect the schema ids reachable through dynamic content, decoding
/// dynamic fields as far as needed.
pub(crate) fn collect_schemata(
    node: &mut Node,
    buf: Option<&[u8]>,
    ctx: &Ctx,
    out: &mut Vec<u64>,
) -> Result<()> {
    match node {
        Node::Tuple(t) => {
            for field in 0..t.schema.field_count() {
                let interesting = matches!(
                    t.schema.fields()[field].ty,
                    FieldTy::Dynamic | FieldTy::List(ElemDecl::Part(_) | ElemDecl::Dynamic)
                );
                if !interesting {
                    continue;
                }
                if matches!(t.cache[field], CacheSlot::Unpopulated) && t.frame.is_some() {
                    let present = t
                        .layout
                        .as_ref()
                        .is_some_and(|layout| layout.is_present(field));
                    if present {
                        let bytes =
                            buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
                        decode_field(t, bytes, ctx, field)?;
                    }
                }
                let is_dynamic = matches!(t.schema.fields()[field].ty, FieldTy::Dynamic);
                match &mut Arc::make_mut(&mut t.cache)[field] {
                    CacheSlot::Opaque { schema_id, .. } => out.push(*schema_id),
                    CacheSlot::Part(child) => {
                        if is_dynamic {
                            if let Node::Tuple(part) = &*child {
                                out.push(part.schema.id());
                            }
                        }
                        collect_schemata(child, buf, ctx, out)?;
                    }
                    _ => {}
                }
            }
        }
        Node::List(l) => {
            let dynamic = matches!(l.elem, ElemDecl::Dynamic);
            for slot in Arc::make_mut(&mut l.cache).iter_mut() {
                match slot {
                    CacheSlot::Opaque { schema_id, .. } => out.push(*schema_id),
                    CacheSlot::Part(child) => {
                        if dynamic {
                            if let Node::Tuple(part) = &*child {
                                out.push(part.schema.id());
                            }
                        }
                        collect_schemata(child, buf, ctx, out)?;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// Rough in-memory cost of fully unassembling this subtree. Fields still
/// sitting in the frame are estimated from their wire lengths without
/// decoding them.
pub(crate) fn estimate_unassembled(node: &Node, buf: Option<&[u8]>) -> Result<usize> {
    let mut total = 0usize;
    match node {
        Node::Tuple(t) => {
            for field in 0..t.schema.field_count() {
                total += match &t.cache[field] {
                    CacheSlot::Value(value) => codec::estimate(value),
                    CacheSlot::Opaque { bytes, .. } => bytes.len(),
                    CacheSlot::Part(child) => estimate_unassembled(child, buf)?,
                    CacheSlot::Null => 0,
                    CacheSlot::Unpopulated => {
                        estimate_framed_field(t, buf, field)?
                    }
                };
            }
        }
        Node::List(l) => {
            for slot in l.cache.iter() {
                total += match slot {
                    CacheSlot::Value(value) => codec::estimate(value),
                    CacheSlot::Opaque { bytes, .. } => bytes.len(),
                    CacheSlot::Part(child) => estimate_unassembled(child, buf)?,
                    _ => 0,
                };
            }
        }
    }
    Ok(total)
}

fn estimate_framed_field(t: &TupleNode, buf: Option<&[u8]>, field: usize) -> Result<usize> {
    let (Some(frame), Some(layout)) = (&t.frame, &t.layout) else {
        return Ok(0);
    };
    if !layout.is_present(field) {
        return Ok(0);
    }
    let bytes = buf.ok_or_else(|| internal("assembled tree without a buffer"))?;
    let abs = layout.field_offset(field, frame.data_start, &frame.table)?;
    match t.schema.fields()[field].ty.fixed_len() {
        Some(width) => Ok(width as usize),
        None => {
            let len = wire::read_u32(bytes, abs)?;
            Ok(if len == wire::NULL_LEN { 0 } else { len as usize })
        }
    }
}
