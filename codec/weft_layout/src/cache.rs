//! Memoized layouts.
//!
//! Inverting a shape code walks the whole type tree; messages of the same
//! schema overwhelmingly share a handful of shapes, so layouts are computed
//! once and shared. The cache is keyed by (schema id, code) and safe to
//! share across message trees.

use std::sync::Arc;

use num_bigint::BigUint;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use weft_schema::{Result, Schema};

use crate::code::{self, Layout};

#[derive(Default)]
pub struct LayoutCache {
    inner: RwLock<FxHashMap<(u64, BigUint), Arc<Layout>>>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The layout selected by `code`, computing and caching it on first use.
    pub fn layout_for(&self, schema: &Schema, code: &BigUint) -> Result<Arc<Layout>> {
        let key = (schema.id(), code.clone());
        if let Some(found) = self.inner.read().get(&key) {
            return Ok(Arc::clone(found));
        }
        tracing::debug!(schema = schema.id(), %code, "layout cache miss");
        let layout = Arc::new(code::code_to_layout(schema, code)?);
        // A racing writer may have inserted the same code; either value is
        // identical, so last write wins harmlessly.
        self.inner.write().insert(key, Arc::clone(&layout));
        Ok(layout)
    }

    /// The layout for an explicit choice vector.
    pub fn layout_for_choices(&self, schema: &Schema, choices: &[i32]) -> Result<Arc<Layout>> {
        let code = code::choices_to_code(schema, choices)?;
        self.layout_for(schema, &code)
    }
}
