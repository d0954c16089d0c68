//! Shape codes and the layouts they select.
//!
//! A schema with variants admits many concrete layouts, one per combination
//! of case choices. Each combination is named by a single non-negative
//! integer, the shape code, assigned by a mixed-radix fold over the type
//! tree: a tuple multiplies by each member's shape count and adds the
//! member's code, and a variant adds the shape counts of all earlier cases
//! before the chosen case's own code. Codes are dense: a schema with N
//! shapes uses exactly the codes `0..N`, in lexicographic order of choices.
//!
//! Codes are arbitrary-precision because shape counts multiply: a tuple of
//! forty optional fields already has 2^40 shapes.

use num_bigint::BigUint;

use weft_schema::{CodeNode, CodecError, Result, Schema};

/// Placement of one present field under a concrete layout.
///
/// The field starts at `data_start + table[offset_slot] + fixed_delta`,
/// where a `None` slot anchors at the data start itself. The offset table
/// entry for slot `i` holds the offset just past the i-th slotted varying
/// field, relative to the data start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Offset-table slot of the nearest preceding varying field, if any.
    pub offset_slot: Option<u32>,
    /// Fixed bytes between that anchor and this field.
    pub fixed_delta: u32,
    /// Whether the field itself is variable-length.
    pub varying: bool,
    /// The slot this field's end offset is recorded in. `None` for fixed
    /// fields and for a varying field nothing follows.
    pub varying_slot: Option<u32>,
}

/// One concrete layout of a schema: a resolved choice per reachable
/// variant, and a placement per present field.
#[derive(Debug, Clone)]
pub struct Layout {
    code: BigUint,
    code_bytes: Vec<u8>,
    /// Chosen case per variant; `-1` where the variant is unreachable
    /// under the choices made above it.
    choices: Vec<i32>,
    /// Placement per field accessor; `None` where the field is absent.
    placements: Vec<Option<Placement>>,
    offset_slots: u32,
}

impl Layout {
    pub fn code(&self) -> &BigUint {
        &self.code
    }

    /// The code in the wire's choice-byte form.
    pub fn code_bytes(&self) -> &[u8] {
        &self.code_bytes
    }

    pub fn choices(&self) -> &[i32] {
        &self.choices
    }

    pub fn placement(&self, field: usize) -> Option<&Placement> {
        self.placements.get(field).and_then(Option::as_ref)
    }

    pub fn is_present(&self, field: usize) -> bool {
        self.placement(field).is_some()
    }

    /// Number of `u32` entries in this layout's offset table.
    pub fn offset_slots(&self) -> u32 {
        self.offset_slots
    }

    /// Absolute offset of a present field given the decoded offset table.
    pub fn field_offset(&self, field: usize, data_start: usize, table: &[u32]) -> Result<usize> {
        let place = self.placement(field).ok_or_else(|| {
            CodecError::UninitializedAccess(format!("field {field} absent under current shape"))
        })?;
        let base = match place.offset_slot {
            Some(slot) => *table.get(slot as usize).ok_or_else(|| {
                CodecError::MessageCorruption(format!("offset table lacks slot {slot}"))
            })? as usize,
            None => 0,
        };
        Ok(data_start + base + place.fixed_delta as usize)
    }
}

/// Fold a full choice vector into its shape code.
///
/// Only variants reachable under the choices themselves are consulted; an
/// unset (`-1`) reachable variant is an [`CodecError::UninitializedAccess`].
#[tracing::instrument(level = "trace", skip_all)]
pub fn choices_to_code(schema: &Schema, choices: &[i32]) -> Result<BigUint> {
    if choices.len() != schema.variant_count() {
        return Err(CodecError::SchemaViolation(format!(
            "{} choices for a schema with {} variants",
            choices.len(),
            schema.variant_count()
        )));
    }
    fold_code(schema, schema.code_tree(), choices)
}

fn fold_code(schema: &Schema, node: &CodeNode, choices: &[i32]) -> Result<BigUint> {
    match node {
        CodeNode::Leaf => Ok(BigUint::from(0u32)),
        CodeNode::Tuple(members) => {
            let mut acc = BigUint::from(0u32);
            for member in members {
                acc = acc * member.count(schema.variants()) + fold_code(schema, member, choices)?;
            }
            Ok(acc)
        }
        CodeNode::Variant { index, cases } => {
            let chosen = choices[*index];
            if chosen < 0 {
                return Err(CodecError::UninitializedAccess(format!(
                    "variant {index} has no case chosen"
                )));
            }
            let chosen = chosen as usize;
            if chosen >= cases.len() {
                return Err(CodecError::SchemaViolation(format!(
                    "variant {index} case {chosen} out of range"
                )));
            }
            let decl = &schema.variants()[*index];
            let before: BigUint = decl.case_counts[..chosen].iter().sum();
            Ok(before + fold_code(schema, &cases[chosen], choices)?)
        }
    }
}

/// Invert a shape code back into choices and derive the field placements.
///
/// A code at or beyond the schema's shape count is corrupt input, not a
/// caller error.
#[tracing::instrument(level = "trace", skip_all)]
pub fn code_to_layout(schema: &Schema, code: &BigUint) -> Result<Layout> {
    if code >= schema.multi_choice_count() {
        return Err(CodecError::MessageCorruption(format!(
            "shape code {code} out of range for schema {:#018x}",
            schema.id()
        )));
    }
    let mut choices = vec![-1i32; schema.variant_count()];
    let leftover = unfold_code(schema, schema.code_tree(), code.clone(), &mut choices)?;
    debug_assert_eq!(leftover, BigUint::from(0u32));
    Ok(layout_for_choices(schema, choices, code.clone()))
}

/// Derive the layout for an explicit, fully-chosen choice vector.
pub fn choices_to_layout(schema: &Schema, choices: &[i32]) -> Result<Layout> {
    let code = choices_to_code(schema, choices)?;
    // Normalize: cases recorded under unreachable variants do not survive.
    code_to_layout(schema, &code)
}

fn unfold_code(
    schema: &Schema,
    node: &CodeNode,
    code: BigUint,
    choices: &mut [i32],
) -> Result<BigUint> {
    match node {
        CodeNode::Leaf => Ok(code),
        CodeNode::Tuple(members) => {
            // The fold multiplied left to right, so peel digits right to
            // left.
            let mut digits = Vec::with_capacity(members.len());
            let mut rest = code;
            for member in members.iter().rev() {
                let radix = member.count(schema.variants());
                digits.push(&rest % &radix);
                rest /= radix;
            }
            for (member, digit) in members.iter().zip(digits.into_iter().rev()) {
                let leftover = unfold_code(schema, member, digit, choices)?;
                debug_assert_eq!(leftover, BigUint::from(0u32));
            }
            Ok(rest)
        }
        CodeNode::Variant { index, cases } => {
            let decl = &schema.variants()[*index];
            let mut rest = code;
            for (ci, case) in cases.iter().enumerate() {
                let count = &decl.case_counts[ci];
                if &rest < count {
                    choices[*index] = ci as i32;
                    return unfold_code(schema, case, rest, choices);
                }
                rest -= count;
            }
            Err(CodecError::MessageCorruption(format!(
                "shape code overruns variant {index}"
            )))
        }
    }
}

fn layout_for_choices(schema: &Schema, choices: Vec<i32>, code: BigUint) -> Layout {
    let mut placements: Vec<Option<Placement>> = vec![None; schema.field_count()];
    let present: Vec<usize> = (0..schema.field_count())
        .filter(|&f| schema.field_consistent(&choices, f))
        .collect();
    let last_present = present.last().copied();

    let mut anchor: Option<u32> = None;
    let mut fixed_delta: u32 = 0;
    let mut next_slot: u32 = 0;
    for &f in &present {
        let decl = &schema.fields()[f];
        let mut place = Placement {
            offset_slot: anchor,
            fixed_delta,
            varying: decl.ty.is_varying(),
            varying_slot: None,
        };
        match decl.ty.fixed_len() {
            Some(width) => fixed_delta += width,
            None => {
                // The trailing varying field self-delimits; everything
                // else needs its end offset recorded for later fields.
                if last_present != Some(f) {
                    place.varying_slot = Some(next_slot);
                    anchor = Some(next_slot);
                    fixed_delta = 0;
                    next_slot += 1;
                }
            }
        }
        placements[f] = Some(place);
    }

    Layout {
        code_bytes: code_bytes(&code),
        code,
        choices,
        placements,
        offset_slots: next_slot,
    }
}

/// Encode a shape code as its wire choice bytes: big-endian two's
/// complement, so a leading zero byte is inserted when the top bit would
/// read as a sign.
pub fn code_bytes(code: &BigUint) -> Vec<u8> {
    let mut bytes = code.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

/// Decode wire choice bytes back into a shape code.
pub fn code_from_bytes(bytes: &[u8]) -> Result<BigUint> {
    if bytes.is_empty() {
        return Err(CodecError::MessageCorruption(
            "empty choice bytes".to_string(),
        ));
    }
    if bytes[0] & 0x80 != 0 {
        // Two's complement on the wire; codes are never negative.
        return Err(CodecError::MessageCorruption(
            "negative shape code".to_string(),
        ));
    }
    Ok(BigUint::from_bytes_be(bytes))
}
