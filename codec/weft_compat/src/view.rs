//! Reading and writing a message through a different schema's numbering.
//!
//! A [`CompatibilityView`] wraps a message encoded under one schema and
//! exposes it under a compatible access schema. While the translation
//! map is in force, every accessor and case number is translated per
//! call and the underlying bytes are never rewritten. A write the map
//! cannot express — a deleted accessor, or one that would force an
//! assembled encoding node to unassemble — triggers transcription: the
//! content is copied into a fresh message under the access schema, the
//! map is dropped, and the view delegates directly from then on.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use weft_message::{Environment, Message, Value};
use weft_schema::{CodecError, ElemDecl, FieldTy, Result, Schema};

use crate::map::{CompatCache, CompatibilityMap};

struct ViewState {
    inner: Message,
    /// `None` once the view has transcribed (or never needed a map) and
    /// become a pure delegator.
    map: Option<Arc<CompatibilityMap>>,
}

/// A message seen through an access schema.
pub struct CompatibilityView {
    access: Arc<Schema>,
    env: Environment,
    state: Mutex<ViewState>,
}

impl CompatibilityView {
    /// View `inner` through `access`. When the schemas already agree the
    /// view starts as a pure delegator; otherwise a translation map is
    /// built (or fetched from `cache`).
    pub fn new(
        access: &Arc<Schema>,
        inner: Message,
        env: &Environment,
        cache: &CompatCache,
    ) -> Result<CompatibilityView> {
        let encoding = inner.schema()?;
        let map = if encoding.id() == access.id() {
            None
        } else {
            Some(cache.map_for(access, &encoding)?)
        };
        Ok(CompatibilityView {
            access: Arc::clone(access),
            env: env.clone(),
            state: Mutex::new(ViewState { inner, map }),
        })
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.access)
    }

    /// Whether the view is still translating through a map.
    pub fn is_translating(&self) -> bool {
        self.state.lock().map.is_some()
    }

    /// Handle on the current underlying message.
    pub fn message(&self) -> Message {
        self.state.lock().inner.clone()
    }

    pub fn get(&self, accessor: usize) -> Result<Value> {
        let state = self.state.lock();
        let Some(map) = &state.map else {
            return state.inner.get(accessor);
        };
        let encoding = deref_accessor(map, accessor)?;
        if self.is_variant_accessor(accessor) {
            let Value::I32(case) = state.inner.get(encoding)? else {
                return Err(CodecError::SchemaViolation(format!(
                    "accessor {accessor} did not read as a case"
                )));
            };
            let translated = map.translate_case_out(encoding, case);
            if translated < 0 {
                return Err(CodecError::UninitializedAccess(format!(
                    "case {case} has no counterpart under the access schema"
                )));
            }
            return Ok(Value::I32(translated));
        }
        state.inner.get(encoding)
    }

    pub fn get_case(&self, accessor: usize) -> Result<i32> {
        let state = self.state.lock();
        let Some(map) = &state.map else {
            return state.inner.get_case(accessor);
        };
        let encoding = deref_accessor(map, accessor)?;
        let case = state.inner.get_case(encoding)?;
        let translated = map.translate_case_out(encoding, case);
        if translated < 0 {
            return Err(CodecError::UninitializedAccess(format!(
                "case {case} has no counterpart under the access schema"
            )));
        }
        Ok(translated)
    }

    pub fn is_present(&self, accessor: usize) -> Result<bool> {
        let state = self.state.lock();
        let Some(map) = &state.map else {
            return state.inner.is_present(accessor);
        };
        match map.index(accessor) {
            None => Err(CodecError::SchemaViolation(format!(
                "accessor {accessor} out of range"
            ))),
            Some(-1) => Ok(false),
            Some(encoding) => state.inner.is_present(encoding as usize),
        }
    }

    pub fn set(&self, accessor: usize, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        let Some(map) = state.map.clone() else {
            return state.inner.set(accessor, value);
        };
        if self.is_variant_accessor(accessor) {
            let case = match value {
                Value::I32(case) => case,
                other => {
                    return Err(CodecError::SchemaViolation(format!(
                        "{other:?} is not a case number"
                    )))
                }
            };
            return self.set_case_locked(&mut state, &map, accessor, case);
        }
        match map.index(accessor) {
            None => Err(CodecError::SchemaViolation(format!(
                "accessor {accessor} out of range"
            ))),
            Some(encoding) if encoding >= 0 && !self.write_needs_transcription(
                &state,
                encoding as usize,
            )? =>
            {
                state.inner.set(encoding as usize, value)
            }
            _ => {
                self.transcribe_locked(&mut state, &map)?;
                state.inner.set(accessor, value)
            }
        }
    }

    pub fn set_case(&self, accessor: usize, case: i32) -> Result<()> {
        let mut state = self.state.lock();
        let Some(map) = state.map.clone() else {
            return state.inner.set_case(accessor, case);
        };
        self.set_case_locked(&mut state, &map, accessor, case)
    }

    /// Copy the content into a fresh message under the access schema and
    /// drop the translation map.
    pub fn transcribe(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(map) = state.map.clone() else {
            return Ok(());
        };
        self.transcribe_locked(&mut state, &map)
    }

    fn set_case_locked(
        &self,
        state: &mut ViewState,
        map: &Arc<CompatibilityMap>,
        accessor: usize,
        case: i32,
    ) -> Result<()> {
        match map.index(accessor) {
            None => Err(CodecError::SchemaViolation(format!(
                "accessor {accessor} out of range"
            ))),
            Some(encoding) if encoding >= 0 => {
                let translated = map.translate_case_in(encoding as usize, case);
                if translated < 0
                    || self.case_write_needs_transcription(state, encoding as usize, translated)?
                {
                    self.transcribe_locked(state, map)?;
                    return state.inner.set_case(accessor, case);
                }
                state.inner.set_case(encoding as usize, translated)
            }
            Some(_) => {
                self.transcribe_locked(state, map)?;
                state.inner.set_case(accessor, case)
            }
        }
    }

    fn is_variant_accessor(&self, accessor: usize) -> bool {
        accessor >= self.access.field_count() && accessor < self.access.first_boxed()
    }

    /// A case write that would change the shape of an assembled encoding
    /// node. Re-asserting the current case is a no-op underneath; any
    /// other case (including one for a currently unreachable variant)
    /// unassembles the node, so the view transcribes instead.
    fn case_write_needs_transcription(
        &self,
        state: &ViewState,
        encoding: usize,
        case: i32,
    ) -> Result<bool> {
        if !state.inner.is_assembled()? {
            return Ok(false);
        }
        match state.inner.get_case(encoding) {
            Ok(current) => Ok(current != case),
            Err(CodecError::UninitializedAccess(_)) => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// A write the map cannot keep cheap: the encoding node is assembled
    /// and the target is absent or variable-length, so the write would
    /// reshape the encoding buffer out from under the map.
    fn write_needs_transcription(&self, state: &ViewState, encoding: usize) -> Result<bool> {
        if !state.inner.is_assembled()? {
            return Ok(false);
        }
        let schema = state.inner.schema()?;
        let Some(decl) = schema.fields().get(encoding) else {
            return Ok(false);
        };
        Ok(decl.ty.is_varying() || !state.inner.is_present(encoding)?)
    }

    fn transcribe_locked(&self, state: &mut ViewState, map: &Arc<CompatibilityMap>) -> Result<()> {
        debug!(
            access = self.access.id(),
            "transcribing onto the access schema"
        );
        let fresh = Message::new(&self.access, &self.env);
        let nf = self.access.field_count();

        // Choices first: they establish the shape the field copies land
        // in. Variants are declared dominator-first, so the forward pass
        // sets dominating cases before dependent ones.
        for variant in 0..self.access.variant_count() {
            let accessor = nf + variant;
            let Some(encoding) = map.index(accessor) else {
                continue;
            };
            if encoding < 0 {
                continue;
            }
            match state.inner.get_case(encoding as usize) {
                Ok(case) => {
                    let translated = map.translate_case_out(encoding as usize, case);
                    if translated >= 0 {
                        fresh.set_case(accessor, translated)?;
                    }
                }
                Err(CodecError::UninitializedAccess(_)) => {}
                Err(err) => return Err(err),
            }
        }
        for field in 0..nf {
            let Some(encoding) = map.index(field) else {
                continue;
            };
            if encoding < 0 {
                continue;
            }
            copy_field(&self.access, field, &state.inner, encoding as usize, &fresh)?;
        }

        // A reachable variant with no counterpart must still hold a case
        // for the message to encode; the first case is its default.
        for variant in 0..self.access.variant_count() {
            let accessor = nf + variant;
            if fresh.is_present(accessor)? {
                continue;
            }
            if self.variant_reachable(&fresh, variant)? {
                fresh.set_case(accessor, 0)?;
            }
        }

        state.inner = fresh;
        state.map = None;
        Ok(())
    }

    fn variant_reachable(&self, fresh: &Message, variant: usize) -> Result<bool> {
        let nf = self.access.field_count();
        let mut dom = self.access.variants()[variant].dominator;
        while let Some((dv, dc)) = dom {
            if !fresh.is_present(nf + dv)? || fresh.get_case(nf + dv)? != dc as i32 {
                return Ok(false);
            }
            dom = self.access.variants()[dv].dominator;
        }
        Ok(true)
    }
}

/// Resolve an access accessor through the map, failing closed.
fn deref_accessor(map: &CompatibilityMap, accessor: usize) -> Result<usize> {
    match map.index(accessor) {
        None => Err(CodecError::SchemaViolation(format!(
            "accessor {accessor} out of range (< {})",
            map.accessor_count()
        ))),
        Some(-1) => Err(CodecError::UninitializedAccess(format!(
            "accessor {accessor} has no counterpart in the encoding schema"
        ))),
        Some(encoding) => Ok(encoding as usize),
    }
}

/// Copy one mapped field from the encoding node into the fresh access
/// node during transcription.
fn copy_field(
    access: &Arc<Schema>,
    field: usize,
    inner: &Message,
    encoding: usize,
    fresh: &Message,
) -> Result<()> {
    match &access.fields()[field].ty {
        FieldTy::Prim(_) | FieldTy::Enum { .. } => match inner.get(encoding) {
            Ok(value) => fresh.set(field, value),
            Err(CodecError::UninitializedAccess(_)) => Ok(()),
            Err(err) => Err(err),
        },
        FieldTy::Dynamic => match inner.get_message(encoding) {
            Ok(part) => fresh.set_message(field, &part),
            Err(CodecError::UninitializedAccess(_)) => Ok(()),
            Err(err) => Err(err),
        },
        FieldTy::List(elem) => match elem {
            ElemDecl::Prim(_) | ElemDecl::Enum { .. } => match inner.get(encoding) {
                Ok(value) => fresh.set(field, value),
                Err(CodecError::UninitializedAccess(_)) => Ok(()),
                Err(err) => Err(err),
            },
            ElemDecl::Part(sub) => {
                let len = match inner.list_len(encoding) {
                    Ok(len) => len,
                    Err(CodecError::UninitializedAccess(_)) => return Ok(()),
                    Err(err) => return Err(err),
                };
                fresh.create_part_list(field, len)?;
                for index in 0..len {
                    let src = inner.get_part(encoding, index)?;
                    if src.schema()?.id() != sub.id() {
                        return Err(CodecError::SchemaViolation(
                            "part list elements changed schema across the map".to_string(),
                        ));
                    }
                    copy_same_schema(&src, &fresh.get_part(field, index)?)?;
                }
                Ok(())
            }
            ElemDecl::Dynamic => {
                let len = match inner.list_len(encoding) {
                    Ok(len) => len,
                    Err(CodecError::UninitializedAccess(_)) => return Ok(()),
                    Err(err) => return Err(err),
                };
                fresh.create_part_list(field, len)?;
                for index in 0..len {
                    let src = inner.get_part(encoding, index)?;
                    let dst = fresh.init_dynamic_elem(field, index, &src.schema()?)?;
                    copy_same_schema(&src, &dst)?;
                }
                Ok(())
            }
        },
    }
}

/// Accessor-by-accessor copy between two nodes of the same schema.
fn copy_same_schema(src: &Message, dst: &Message) -> Result<()> {
    let schema = src.schema()?;
    let nf = schema.field_count();
    for variant in 0..schema.variant_count() {
        match src.get_case(nf + variant) {
            Ok(case) => dst.set_case(nf + variant, case)?,
            Err(CodecError::UninitializedAccess(_)) => {}
            Err(err) => return Err(err),
        }
    }
    for field in 0..nf {
        copy_field(&schema, field, src, field, dst)?;
    }
    Ok(())
}
