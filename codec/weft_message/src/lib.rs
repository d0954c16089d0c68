//! Lazy copy-on-write message trees over Weft schemas.
//!
//! Decoding a message reads only its header; every field stays encoded
//! in the backing buffer until first access. Mutations write small
//! changes back into the buffer in place and unassemble just the nodes
//! whose bytes they invalidate, so a message that is routed without
//! being touched is never fully decoded, and one that is touched pays
//! only for what it touched.

mod codec;
mod message;
mod node;
mod value;

pub use message::{Environment, Message};
pub use value::Value;

#[cfg(test)]
mod tests;
