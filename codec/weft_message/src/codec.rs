//! Leaf-value codecs: validation, sizing, encode, decode.
//!
//! Everything here works on [`Value`]s and raw buffer offsets. Nested
//! parts (dynamic content, part lists) are composed in `node`, which
//! calls back into these routines for the leaves.
//!
//! Variable-length values self-delimit with a leading `u32` payload
//! length; the [`wire::NULL_LEN`] sentinel encodes a logically absent
//! value in 4 bytes and nothing else.

use weft_schema::{CodecError, ElemDecl, FieldTy, PrimKind, Result};
use weft_wire as wire;

use crate::value::Value;

fn prim_matches(p: PrimKind, value: &Value) -> bool {
    matches!(
        (p, value),
        (PrimKind::Bool, Value::Bool(_))
            | (PrimKind::I8, Value::I8(_))
            | (PrimKind::I16, Value::I16(_))
            | (PrimKind::I32, Value::I32(_))
            | (PrimKind::I64, Value::I64(_))
            | (PrimKind::F32, Value::F32(_))
            | (PrimKind::F64, Value::F64(_))
            | (PrimKind::Str, Value::Str(_))
            | (PrimKind::Bytes, Value::Bytes(_))
    )
}

fn elem_matches(elem: &ElemDecl, value: &Value) -> bool {
    match (elem, value) {
        (ElemDecl::Prim(p), v) => {
            prim_matches(*p, v) || (p.fixed_len().is_none() && v.is_null())
        }
        (ElemDecl::Enum { enumerators }, Value::Enum(e)) => e < enumerators,
        _ => false,
    }
}

/// Check a value against the declared field type.
pub(crate) fn validate(ty: &FieldTy, value: &Value) -> Result<()> {
    let ok = match (ty, value) {
        // Null is representable for variable-length fields only.
        (_, Value::Null) => ty.is_varying(),
        (FieldTy::Prim(p), v) => prim_matches(*p, v),
        (FieldTy::Enum { enumerators }, Value::Enum(e)) => e < enumerators,
        (FieldTy::List(elem), Value::List(items)) => match elem {
            ElemDecl::Prim(_) | ElemDecl::Enum { .. } => {
                items.iter().all(|item| elem_matches(elem, item))
            }
            // Structured and dynamic elements are parts, not values.
            ElemDecl::Dynamic | ElemDecl::Part(_) => false,
        },
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(CodecError::SchemaViolation(format!(
            "value {value:?} does not fit field type {ty:?}"
        )))
    }
}

/// Encode a fixed-width value at `off`.
pub(crate) fn encode_fixed(buf: &mut [u8], off: usize, value: &Value) -> Result<()> {
    match value {
        Value::Bool(v) => wire::write_u8(buf, off, u8::from(*v))?,
        Value::I8(v) => wire::write_i8(buf, off, *v)?,
        Value::I16(v) => wire::write_i16(buf, off, *v)?,
        Value::I32(v) => wire::write_i32(buf, off, *v)?,
        Value::I64(v) => wire::write_i64(buf, off, *v)?,
        Value::F32(v) => wire::write_f32(buf, off, *v)?,
        Value::F64(v) => wire::write_f64(buf, off, *v)?,
        Value::Enum(v) => wire::write_u32(buf, off, *v)?,
        other => {
            return Err(CodecError::SchemaViolation(format!(
                "{other:?} is not a fixed-width value"
            )))
        }
    }
    Ok(())
}

fn decode_prim_fixed(p: PrimKind, buf: &[u8], off: usize) -> Result<Value> {
    Ok(match p {
        PrimKind::Bool => Value::Bool(wire::read_u8(buf, off)? != 0),
        PrimKind::I8 => Value::I8(wire::read_i8(buf, off)?),
        PrimKind::I16 => Value::I16(wire::read_i16(buf, off)?),
        PrimKind::I32 => Value::I32(wire::read_i32(buf, off)?),
        PrimKind::I64 => Value::I64(wire::read_i64(buf, off)?),
        PrimKind::F32 => Value::F32(wire::read_f32(buf, off)?),
        PrimKind::F64 => Value::F64(wire::read_f64(buf, off)?),
        PrimKind::Str | PrimKind::Bytes => {
            return Err(CodecError::MessageCorruption(
                "variable-length primitive read as fixed".to_string(),
            ))
        }
    })
}

/// Decode a fixed-width field value at `off`.
pub(crate) fn decode_fixed(ty: &FieldTy, buf: &[u8], off: usize) -> Result<Value> {
    match ty {
        FieldTy::Prim(p) => decode_prim_fixed(*p, buf, off),
        FieldTy::Enum { enumerators } => {
            let raw = wire::read_u32(buf, off)?;
            if raw >= *enumerators {
                return Err(CodecError::MessageCorruption(format!(
                    "enumerator {raw} out of range (< {enumerators})"
                )));
            }
            Ok(Value::Enum(raw))
        }
        FieldTy::Dynamic | FieldTy::List(_) => Err(CodecError::MessageCorruption(
            "variable-length field read as fixed".to_string(),
        )),
    }
}

fn elem_len(elem: &ElemDecl, value: &Value) -> Result<usize> {
    match (elem, value) {
        (ElemDecl::Prim(p), v) => match p.fixed_len() {
            Some(w) => Ok(w as usize),
            None => match v {
                Value::Null => Ok(4),
                Value::Str(s) => Ok(4 + s.len()),
                Value::Bytes(b) => Ok(4 + b.len()),
                other => Err(CodecError::SchemaViolation(format!(
                    "{other:?} is not a {p:?} element"
                ))),
            },
        },
        (ElemDecl::Enum { .. }, _) => Ok(4),
        (ElemDecl::Dynamic | ElemDecl::Part(_), _) => Err(CodecError::SchemaViolation(
            "structured list element carried as a value".to_string(),
        )),
    }
}

/// Byte length of a variable-length value's payload (excluding its own
/// leading `u32`).
pub(crate) fn payload_len(ty: &FieldTy, value: &Value) -> Result<usize> {
    match (ty, value) {
        (_, Value::Str(s)) => Ok(s.len()),
        (_, Value::Bytes(b)) => Ok(b.len()),
        (FieldTy::List(elem), Value::List(items)) => {
            let mut total = 4usize;
            for item in items {
                total += elem_len(elem, item)?;
            }
            Ok(total)
        }
        _ => Err(CodecError::SchemaViolation(format!(
            "{value:?} is not a variable-length value"
        ))),
    }
}

/// Write a variable-length value (length prefix included) at `off`;
/// returns the bytes written.
pub(crate) fn write_varying(
    ty: &FieldTy,
    buf: &mut [u8],
    off: usize,
    value: &Value,
) -> Result<usize> {
    match (ty, value) {
        (_, Value::Null) => {
            wire::write_u32(buf, off, wire::NULL_LEN)?;
            Ok(4)
        }
        (_, Value::Str(s)) => {
            wire::write_u32(buf, off, s.len() as u32)?;
            wire::write_bytes(buf, off + 4, s.as_bytes())?;
            Ok(4 + s.len())
        }
        (_, Value::Bytes(b)) => {
            wire::write_u32(buf, off, b.len() as u32)?;
            wire::write_bytes(buf, off + 4, b)?;
            Ok(4 + b.len())
        }
        (FieldTy::List(elem), Value::List(items)) => {
            let payload = payload_len(ty, value)?;
            wire::write_u32(buf, off, payload as u32)?;
            wire::write_u32(buf, off + 4, items.len() as u32)?;
            let mut at = off + 8;
            for item in items {
                at += write_elem(elem, buf, at, item)?;
            }
            Ok(4 + payload)
        }
        _ => Err(CodecError::SchemaViolation(format!(
            "{value:?} is not a variable-length value"
        ))),
    }
}

fn write_elem(elem: &ElemDecl, buf: &mut [u8], off: usize, value: &Value) -> Result<usize> {
    match value {
        Value::Null => {
            wire::write_u32(buf, off, wire::NULL_LEN)?;
            Ok(4)
        }
        Value::Str(s) => {
            wire::write_u32(buf, off, s.len() as u32)?;
            wire::write_bytes(buf, off + 4, s.as_bytes())?;
            Ok(4 + s.len())
        }
        Value::Bytes(b) => {
            wire::write_u32(buf, off, b.len() as u32)?;
            wire::write_bytes(buf, off + 4, b)?;
            Ok(4 + b.len())
        }
        fixed => {
            encode_fixed(buf, off, fixed)?;
            elem_len(elem, fixed)
        }
    }
}

/// Read a variable-length value whose `u32` length prefix sits at `off`.
pub(crate) fn read_varying(ty: &FieldTy, buf: &[u8], off: usize) -> Result<Value> {
    let len = wire::read_u32(buf, off)?;
    if len == wire::NULL_LEN {
        return Ok(Value::Null);
    }
    let len = len as usize;
    let payload = wire::read_bytes(buf, off + 4, len)?;
    match ty {
        FieldTy::Prim(PrimKind::Str) => {
            let text = std::str::from_utf8(payload).map_err(|_| {
                CodecError::MessageCorruption("string payload is not UTF-8".to_string())
            })?;
            Ok(Value::Str(text.to_string()))
        }
        FieldTy::Prim(PrimKind::Bytes) => Ok(Value::Bytes(payload.to_vec())),
        FieldTy::List(elem) => read_list(elem, buf, off + 4, len),
        _ => Err(CodecError::MessageCorruption(format!(
            "{ty:?} is not a variable-length leaf"
        ))),
    }
}

fn read_list(elem: &ElemDecl, buf: &[u8], start: usize, payload: usize) -> Result<Value> {
    if payload < 4 {
        return Err(CodecError::MessageCorruption(
            "list payload too short for its element count".to_string(),
        ));
    }
    let end = start + payload;
    let count = wire::read_u32(buf, start)? as usize;
    // Each element occupies at least one byte; reject counts the payload
    // cannot possibly hold before allocating.
    if count > payload - 4 {
        return Err(CodecError::MessageCorruption(format!(
            "list count {count} exceeds payload {payload}"
        )));
    }
    let mut items = Vec::with_capacity(count);
    let mut at = start + 4;
    for _ in 0..count {
        let (item, used) = read_elem(elem, buf, at)?;
        items.push(item);
        at += used;
    }
    if at != end {
        return Err(CodecError::MessageCorruption(
            "list payload length disagrees with its elements".to_string(),
        ));
    }
    Ok(Value::List(items))
}

fn read_elem(elem: &ElemDecl, buf: &[u8], off: usize) -> Result<(Value, usize)> {
    match elem {
        ElemDecl::Prim(p) => match p.fixed_len() {
            Some(w) => Ok((decode_prim_fixed(*p, buf, off)?, w as usize)),
            None => {
                let len = wire::read_u32(buf, off)?;
                if len == wire::NULL_LEN {
                    return Ok((Value::Null, 4));
                }
                let payload = wire::read_bytes(buf, off + 4, len as usize)?;
                let value = match p {
                    PrimKind::Str => {
                        let text = std::str::from_utf8(payload).map_err(|_| {
                            CodecError::MessageCorruption(
                                "string payload is not UTF-8".to_string(),
                            )
                        })?;
                        Value::Str(text.to_string())
                    }
                    _ => Value::Bytes(payload.to_vec()),
                };
                Ok((value, 4 + len as usize))
            }
        },
        ElemDecl::Enum { enumerators } => {
            let raw = wire::read_u32(buf, off)?;
            if raw >= *enumerators {
                return Err(CodecError::MessageCorruption(format!(
                    "enumerator {raw} out of range (< {enumerators})"
                )));
            }
            Ok((Value::Enum(raw), 4))
        }
        ElemDecl::Dynamic | ElemDecl::Part(_) => Err(CodecError::MessageCorruption(
            "structured list element decoded as a value".to_string(),
        )),
    }
}

/// Rough in-memory size of an unassembled value, for unassembly
/// budgeting. Absent values cost nothing.
pub(crate) fn estimate(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::I8(_) => 1,
        Value::I16(_) => 2,
        Value::I32(_) | Value::F32(_) | Value::Enum(_) => 4,
        Value::I64(_) | Value::F64(_) => 8,
        Value::Str(s) => s.len(),
        Value::Bytes(b) => b.len(),
        Value::List(items) => 4 + items.iter().map(estimate).sum::<usize>(),
    }
}
