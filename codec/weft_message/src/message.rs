//! Message trees and their handles.
//!
//! A [`Message`] is a handle: an `Arc` to the tree root plus the path of
//! the node it names. Handles are cheap to clone and every one of them
//! funnels through the root's single mutex, so an operation anywhere in
//! a tree sees a consistent whole and nested-part recursion never takes
//! a second lock.
//!
//! Mutation is copy-on-write across trees. `copy()` on a root aliases
//! the backing buffer; the first mutation on either side breaks the
//! alias, by copying the bytes when they are small and by unassembling
//! the tree when they are not.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use weft_layout::LayoutCache;
use weft_schema::{CodecError, Result, Schema, SchemaResolver};
use weft_wire as wire;

use crate::node::{self, CowBuf, Ctx, Node, Step, Target, TupleNode};
use crate::value::Value;

/// Shared decode environment: the layout cache, and the resolver that
/// maps dynamic schema ids to schemas. Clone it freely; clones share.
#[derive(Clone, Default)]
pub struct Environment {
    layouts: Arc<LayoutCache>,
    resolver: Option<Arc<dyn SchemaResolver>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(resolver: Arc<dyn SchemaResolver>) -> Self {
        Self {
            layouts: Arc::new(LayoutCache::new()),
            resolver: Some(resolver),
        }
    }

    fn ctx(&self) -> Ctx {
        Ctx {
            layouts: Arc::clone(&self.layouts),
            resolver: self.resolver.clone(),
        }
    }
}

pub(crate) struct Root {
    node: Node,
    buf: Option<CowBuf>,
    layouts: Arc<LayoutCache>,
    resolver: Option<Arc<dyn SchemaResolver>>,
    /// Memoized transitive dynamic schema ids; dropped on any mutation.
    schemata: Option<Vec<u64>>,
}

impl Root {
    fn ctx(&self) -> Ctx {
        Ctx {
            layouts: Arc::clone(&self.layouts),
            resolver: self.resolver.clone(),
        }
    }

    /// Make this tree sole owner of its bytes before a mutation. Small
    /// buffers are copied; large ones are walked off into caches and
    /// dropped.
    fn break_sharing(&mut self) -> Result<()> {
        let state = self.buf.as_ref().map(|b| (b.is_shared(), b.len()));
        match state {
            Some((true, len)) if len < node::SHARE_COPY_LIMIT => {
                debug!(len, "copying shared buffer before mutation");
                if let Some(buf) = self.buf.as_mut() {
                    buf.make_mut();
                }
            }
            Some((true, len)) => {
                debug!(len, "unassembling shared tree before mutation");
                let ctx = self.ctx();
                let Root { node, buf, .. } = self;
                let slice = buf.as_ref().map(CowBuf::as_slice);
                node::unassemble_deep(node, slice, &ctx)?;
                *buf = None;
            }
            _ => {}
        }
        Ok(())
    }
}

/// A handle on a message tree node. The root handle owns the tree;
/// part handles reach nested content through the same root lock.
#[derive(Clone)]
pub struct Message {
    root: Arc<Mutex<Root>>,
    path: Vec<Step>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("depth", &self.path.len())
            .finish_non_exhaustive()
    }
}

impl Message {
    /// A fresh, fully unassembled message of `schema`.
    pub fn new(schema: &Arc<Schema>, env: &Environment) -> Message {
        Message {
            root: Arc::new(Mutex::new(Root {
                node: Node::Tuple(TupleNode::empty(Arc::clone(schema))),
                buf: None,
                layouts: Arc::clone(&env.layouts),
                resolver: env.resolver.clone(),
                schemata: None,
            })),
            path: Vec::new(),
        }
    }

    /// Wrap an encoded message body. Only the header is decoded here;
    /// field bytes stay in place until someone asks for them.
    pub fn from_bytes(schema: &Arc<Schema>, bytes: Vec<u8>, env: &Environment) -> Result<Message> {
        let ctx = env.ctx();
        let buf = CowBuf::new(bytes);
        let len = buf.len();
        let tuple = node::decode_body(schema, buf.as_slice(), 0, len, &ctx)?;
        Ok(Message {
            root: Arc::new(Mutex::new(Root {
                node: Node::Tuple(tuple),
                buf: Some(buf),
                layouts: Arc::clone(&env.layouts),
                resolver: env.resolver.clone(),
                schemata: None,
            })),
            path: Vec::new(),
        })
    }

    /// Decode a framed message: the dependent-schema id table followed
    /// by the body.
    pub fn from_frame(schema: &Arc<Schema>, bytes: &[u8], env: &Environment) -> Result<Message> {
        let count = wire::read_u16(bytes, 0)? as usize;
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(wire::read_u64(bytes, 2 + 8 * i)?);
        }
        let body_start = 2 + 8 * count;
        let body_len = bytes.len().checked_sub(body_start).ok_or_else(|| {
            CodecError::MessageCorruption("schema id table runs past the frame".to_string())
        })?;
        let body = wire::read_bytes(bytes, body_start, body_len)?.to_vec();
        let message = Self::from_bytes(schema, body, env)?;
        ids.sort_unstable();
        ids.dedup();
        message.root.lock().schemata = Some(ids);
        Ok(message)
    }

    /// Schema of the node this handle names.
    pub fn schema(&self) -> Result<Arc<Schema>> {
        self.read(|node, _, _| node::node_schema(node))
    }

    // -- values and cases ---------------------------------------------------

    /// Read through an accessor: a field value, a variant case (as
    /// `I32`), or a boxed fan-out (as `List`).
    pub fn get(&self, accessor: usize) -> Result<Value> {
        self.read(|node, buf, ctx| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Field(f) => node::read_field(node, buf, ctx, f),
                Target::Variant(v) => Ok(Value::I32(node::read_case(node, v)?)),
                Target::Boxed(boxed) => node::boxed_read(node, buf, ctx, boxed),
            }
        })
    }

    /// Write through an accessor. Variant targets take `I32` cases,
    /// boxed targets take one `List` item per element.
    pub fn set(&self, accessor: usize, value: Value) -> Result<()> {
        self.mutate(|node, buf, at_root, ctx| {
            let schema = node::node_schema(node)?;
            let dirty = match node::resolve_accessor(&schema, accessor)? {
                Target::Field(f) => node::op_set_field(node, buf, at_root, ctx, f, &value)?,
                Target::Variant(v) => {
                    let Value::I32(case) = &value else {
                        return Err(CodecError::SchemaViolation(format!(
                            "{value:?} is not a case number"
                        )));
                    };
                    node::op_set_case(node, buf, ctx, v, *case)?
                }
                Target::Boxed(boxed) => {
                    let Value::List(items) = &value else {
                        return Err(CodecError::SchemaViolation(format!(
                            "{value:?} is not a boxed item list"
                        )));
                    };
                    node::op_boxed_set(node, buf, ctx, boxed, items)?
                }
            };
            Ok(((), dirty))
        })
    }

    /// Case currently chosen for a variant accessor.
    pub fn get_case(&self, accessor: usize) -> Result<i32> {
        self.read(|node, _, _| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Variant(v) => node::read_case(node, v),
                _ => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a variant"
                ))),
            }
        })
    }

    /// Choose a variant's case, forcing every dominating case with it.
    pub fn set_case(&self, accessor: usize, case: i32) -> Result<()> {
        self.mutate(|node, buf, _, ctx| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Variant(v) => Ok(((), node::op_set_case(node, buf, ctx, v, case)?)),
                _ => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a variant"
                ))),
            }
        })
    }

    /// Whether a field is present under the node's current shape, or a
    /// variant has a case chosen.
    pub fn is_present(&self, accessor: usize) -> Result<bool> {
        self.read(|node, _, _| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Field(f) => node::field_present(node, f),
                Target::Variant(v) => match node::read_case(node, v) {
                    Ok(_) => Ok(true),
                    Err(CodecError::UninitializedAccess(_)) => Ok(false),
                    Err(err) => Err(err),
                },
                Target::Boxed(_) => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is boxed; presence follows its box list"
                ))),
            }
        })
    }

    // -- nested parts -------------------------------------------------------

    /// Element count of a list field.
    pub fn list_len(&self, accessor: usize) -> Result<usize> {
        self.read(|node, buf, ctx| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Field(f) => node::read_list_len(node, buf, ctx, f),
                _ => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a list field"
                ))),
            }
        })
    }

    /// Install a fresh part list of `len` elements behind a structured
    /// list field. Part elements start empty; dynamic elements start
    /// uninitialized.
    pub fn create_part_list(&self, accessor: usize, len: usize) -> Result<()> {
        self.mutate(|node, buf, _, ctx| {
            let schema = node::node_schema(node)?;
            match node::resolve_accessor(&schema, accessor)? {
                Target::Field(f) => Ok(((), node::op_create_list(node, buf, ctx, f, len)?)),
                _ => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a list field"
                ))),
            }
        })
    }

    /// Handle on one element of a part list.
    pub fn get_part(&self, accessor: usize, index: usize) -> Result<Message> {
        let field = self.read(|node, buf, ctx| {
            let schema = node::node_schema(node)?;
            let Target::Field(f) = node::resolve_accessor(&schema, accessor)? else {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a field"
                )));
            };
            let elem = node::navigate(node, buf, ctx, &[Step::Field(f), Step::Elem(index)])?;
            match elem {
                Node::Tuple(_) => Ok(f),
                Node::List(_) => Err(CodecError::SchemaViolation(format!(
                    "element {index} is not a part"
                ))),
            }
        })?;
        Ok(self.child(&[Step::Field(field), Step::Elem(index)]))
    }

    /// Handle on the message behind a dynamic field.
    pub fn get_message(&self, accessor: usize) -> Result<Message> {
        let field = self.read(|node, buf, ctx| {
            let schema = node::node_schema(node)?;
            let Target::Field(f) = node::resolve_accessor(&schema, accessor)? else {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a field"
                )));
            };
            let child = node::navigate(node, buf, ctx, &[Step::Field(f)])?;
            match child {
                Node::Tuple(_) => Ok(f),
                Node::List(_) => Err(CodecError::SchemaViolation(format!(
                    "field {accessor} holds a list; use get_part"
                ))),
            }
        })?;
        Ok(self.child(&[Step::Field(field)]))
    }

    /// Give a dynamic field a fresh empty message of `schema` and hand
    /// back its part handle.
    pub fn init_dynamic(&self, accessor: usize, schema: &Arc<Schema>) -> Result<Message> {
        let part_schema = Arc::clone(schema);
        let field = self.mutate(move |node, buf, _, ctx| {
            let own = node::node_schema(node)?;
            let Target::Field(f) = node::resolve_accessor(&own, accessor)? else {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a field"
                )));
            };
            let part = Node::Tuple(TupleNode::empty(Arc::clone(&part_schema)));
            let dirty = node::op_install_part(node, buf, ctx, Step::Field(f), part)?;
            Ok((f, dirty))
        })?;
        Ok(self.child(&[Step::Field(field)]))
    }

    /// Give one element of a dynamic-element list a fresh empty message.
    pub fn init_dynamic_elem(
        &self,
        accessor: usize,
        index: usize,
        schema: &Arc<Schema>,
    ) -> Result<Message> {
        let field = self.read(|node, _, _| {
            let own = node::node_schema(node)?;
            match node::resolve_accessor(&own, accessor)? {
                Target::Field(f) => Ok(f),
                _ => Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a field"
                ))),
            }
        })?;
        let list_handle = self.child(&[Step::Field(field)]);
        let part_schema = Arc::clone(schema);
        list_handle.mutate(move |node, buf, _, ctx| {
            let part = Node::Tuple(TupleNode::empty(Arc::clone(&part_schema)));
            Ok(((), node::op_install_part(node, buf, ctx, Step::Elem(index), part)?))
        })?;
        Ok(self.child(&[Step::Field(field), Step::Elem(index)]))
    }

    /// Embed a copy of another message behind a dynamic field. The
    /// source is read under its own lock first, so no two tree locks are
    /// ever held together.
    pub fn set_message(&self, accessor: usize, source: &Message) -> Result<()> {
        let detached = source.detach()?;
        let mut pending = Some(detached);
        self.mutate(move |node, buf, _, ctx| {
            let schema = node::node_schema(node)?;
            let Target::Field(f) = node::resolve_accessor(&schema, accessor)? else {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} is not a field"
                )));
            };
            let part = pending.take().ok_or_else(|| {
                CodecError::SchemaViolation("message already consumed".to_string())
            })?;
            Ok(((), node::op_install_part(node, buf, ctx, Step::Field(f), part)?))
        })
    }

    // -- whole-tree operations ----------------------------------------------

    /// Logical copy. Copying a root aliases the tree copy-on-write;
    /// copying a part handle detaches an independent tree.
    pub fn copy(&self) -> Result<Message> {
        let mut guard = self.root.lock();
        let root = &mut *guard;
        if self.path.is_empty() {
            debug!("aliasing tree for copy-on-write");
            let cloned = Root {
                node: root.node.clone(),
                buf: root.buf.clone(),
                layouts: Arc::clone(&root.layouts),
                resolver: root.resolver.clone(),
                schemata: root.schemata.clone(),
            };
            return Ok(Message {
                root: Arc::new(Mutex::new(cloned)),
                path: Vec::new(),
            });
        }
        let ctx = root.ctx();
        let Root { node, buf, .. } = root;
        let slice = buf.as_ref().map(CowBuf::as_slice);
        let target = node::navigate(node, slice, &ctx, &self.path)?;
        let mut detached = target.clone();
        node::unassemble_deep(&mut detached, slice, &ctx)?;
        if !matches!(detached, Node::Tuple(_)) {
            return Err(CodecError::SchemaViolation(
                "cannot copy a bare list handle".to_string(),
            ));
        }
        Ok(Message {
            root: Arc::new(Mutex::new(Root {
                node: detached,
                buf: None,
                layouts: Arc::clone(&ctx.layouts),
                resolver: ctx.resolver.clone(),
                schemata: None,
            })),
            path: Vec::new(),
        })
    }

    /// Pull the whole subtree into caches, dropping its frames. The root
    /// handle also releases the backing buffer.
    pub fn unassemble(&self) -> Result<()> {
        self.mutate(|node, buf, at_root, ctx| {
            let had_frame = matches!(node, Node::Tuple(t) if t.frame.is_some());
            {
                let slice = buf.as_ref().map(CowBuf::as_slice);
                node::unassemble_deep(node, slice, ctx)?;
            }
            if at_root {
                *buf = None;
            }
            Ok(((), had_frame))
        })
    }

    /// Serialize the node's body. On a root handle this also reassembles
    /// the tree in place: the fresh bytes become the backing buffer and
    /// nested content returns to lazy decoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut guard = self.root.lock();
        let root = &mut *guard;
        if !self.path.is_empty() {
            let ctx = root.ctx();
            let Root { node, buf, .. } = root;
            let slice = buf.as_ref().map(CowBuf::as_slice);
            let target = node::navigate(node, slice, &ctx, &self.path)?;
            return node::assemble(target, slice, &ctx);
        }
        Self::root_body_locked(root)
    }

    /// Serialize a root message in framed form: dependent schema id
    /// table, then the body. Both halves are produced under one lock
    /// hold, so the table always covers exactly the ids the body uses.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        if !self.path.is_empty() {
            return Err(CodecError::SchemaViolation(
                "framed encoding is for root messages".to_string(),
            ));
        }
        let mut guard = self.root.lock();
        let root = &mut *guard;
        let ids = Self::schemata_locked(root, &self.path)?;
        let body = Self::root_body_locked(root)?;
        let mut out = vec![0u8; 2 + 8 * ids.len() + body.len()];
        wire::write_u16(&mut out, 0, ids.len() as u16)?;
        for (i, id) in ids.iter().enumerate() {
            wire::write_u64(&mut out, 2 + 8 * i, *id)?;
        }
        wire::write_bytes(&mut out, 2 + 8 * ids.len(), &body)?;
        Ok(out)
    }

    /// Whether the node this handle names still sits on an encoded
    /// frame.
    pub fn is_assembled(&self) -> Result<bool> {
        self.read(|node, _, _| Ok(matches!(node, Node::Tuple(t) if t.frame.is_some())))
    }

    /// Encoded body length without serializing.
    pub fn encoded_len(&self) -> Result<usize> {
        self.read(|node, _, ctx| node::body_len(node, ctx))
    }

    /// Rough in-memory cost of fully unassembling this subtree.
    pub fn unassembled_estimate(&self) -> Result<usize> {
        self.read(|node, buf, _| node::estimate_unassembled(node, buf))
    }

    /// Ids of every schema reachable through dynamic content, sorted and
    /// deduplicated. Memoized on root handles until the next mutation.
    pub fn schemata(&self) -> Result<Vec<u64>> {
        let mut guard = self.root.lock();
        Self::schemata_locked(&mut guard, &self.path)
    }

    /// Serialize the root body under an already-held lock, installing
    /// the reassembled frame in place.
    fn root_body_locked(root: &mut Root) -> Result<Vec<u8>> {
        let ctx = root.ctx();
        let already_assembled = matches!(&root.node, Node::Tuple(t) if t.frame.is_some());
        let bytes = {
            let Root { node, buf, .. } = root;
            let slice = buf.as_ref().map(CowBuf::as_slice);
            node::assemble(node, slice, &ctx)?
        };
        if !already_assembled {
            debug!(len = bytes.len(), "installing reassembled root");
            let schema = node::node_schema(&root.node)?;
            let fresh_buf = CowBuf::new(bytes.clone());
            let mut fresh = node::decode_body(&schema, fresh_buf.as_slice(), 0, bytes.len(), &ctx)?;
            node::port_value_cache(&root.node, &mut fresh);
            root.node = Node::Tuple(fresh);
            root.buf = Some(fresh_buf);
        }
        Ok(bytes)
    }

    fn schemata_locked(root: &mut Root, path: &[Step]) -> Result<Vec<u64>> {
        if path.is_empty() {
            if let Some(ids) = &root.schemata {
                return Ok(ids.clone());
            }
        }
        let ctx = root.ctx();
        let Root {
            node,
            buf,
            schemata,
            ..
        } = root;
        let slice = buf.as_ref().map(CowBuf::as_slice);
        let target = node::navigate(node, slice, &ctx, path)?;
        let mut ids = Vec::new();
        node::collect_schemata(target, slice, &ctx, &mut ids)?;
        ids.sort_unstable();
        ids.dedup();
        if path.is_empty() {
            *schemata = Some(ids.clone());
        }
        Ok(ids)
    }

    // -- plumbing -----------------------------------------------------------

    fn child(&self, steps: &[Step]) -> Message {
        let mut path = self.path.clone();
        path.extend_from_slice(steps);
        Message {
            root: Arc::clone(&self.root),
            path,
        }
    }

    /// Detached deep-unassembled clone of this handle's subtree.
    fn detach(&self) -> Result<Node> {
        let mut guard = self.root.lock();
        let root = &mut *guard;
        let ctx = root.ctx();
        let Root { node, buf, .. } = root;
        let slice = buf.as_ref().map(CowBuf::as_slice);
        let target = node::navigate(node, slice, &ctx, &self.path)?;
        let mut detached = target.clone();
        node::unassemble_deep(&mut detached, slice, &ctx)?;
        Ok(detached)
    }

    fn read<R>(&self, f: impl FnOnce(&mut Node, Option<&[u8]>, &Ctx) -> Result<R>) -> Result<R> {
        let mut guard = self.root.lock();
        let root = &mut *guard;
        let ctx = root.ctx();
        let Root { node, buf, .. } = root;
        let slice = buf.as_ref().map(CowBuf::as_slice);
        let target = node::navigate(node, slice, &ctx, &self.path)?;
        f(target, slice, &ctx)
    }

    fn mutate<R>(
        &self,
        mut op: impl FnMut(&mut Node, &mut Option<CowBuf>, bool, &Ctx) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut guard = self.root.lock();
        let root = &mut *guard;
        root.schemata = None;
        root.break_sharing()?;
        let ctx = root.ctx();
        let (result, _) = node::mutate_at(
            &mut root.node,
            &mut root.buf,
            &ctx,
            &self.path,
            self.path.is_empty(),
            &mut op,
        )?;
        Ok(result)
    }
}
