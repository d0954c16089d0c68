//! Field values as seen by callers.

/// One field value.
///
/// `Null` is only valid for variable-length fields; fixed-width fields
/// have no wire representation for absence. Nested parts (dynamic
/// content, part lists) are not values; they are reached through part
/// handles on [`crate::Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Enum(u32),
    /// A list of primitive-kind values. Lists of structured elements are
    /// nested parts, not values.
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}
