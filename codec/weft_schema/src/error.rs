//! The error taxonomy shared by every Weft crate.

use thiserror::Error;
use weft_wire::WireError;

/// Failure modes of encoding, decoding, and schema bridging.
///
/// Nothing here is retried internally: a `SchemaViolation` is a caller
/// error, an `UninitializedAccess` is recoverable caller logic ("field not
/// set"), a `MessageCorruption` is fatal for the buffer in question, and a
/// `ModelNotImplemented` is a permanent configuration fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A value, type, or shape does not match the declared schema,
    /// including a failed compatibility-map construction.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A read of a field that is absent under the current shape, or one
    /// deleted by a compatibility map.
    #[error("uninitialized access: {0}")]
    UninitializedAccess(String),

    /// Malformed wire bytes: negative or overlong lengths, offsets beyond
    /// buffer bounds, out-of-range shape codes.
    #[error("message corruption: {0}")]
    MessageCorruption(String),

    /// A dynamic field references a schema id with no registered model.
    #[error("model not implemented: schema id {0:#018x}")]
    ModelNotImplemented(u64),
}

impl From<WireError> for CodecError {
    fn from(err: WireError) -> Self {
        CodecError::MessageCorruption(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
