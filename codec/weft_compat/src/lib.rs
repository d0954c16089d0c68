//! The schema-compatibility bridge.
//!
//! Communicating parties rarely upgrade schemas in lockstep. This crate
//! lets a message encoded under one schema be read and written under a
//! compatible sibling: [`CompatibilityMap`] records the accessor and
//! case translation between the two numberings, [`CompatibilityView`]
//! applies it per call, and transcription re-homes the content under
//! the access schema when translation alone cannot express a write.

mod map;
mod view;

pub use map::{CompatCache, CompatibilityMap};
pub use view::CompatibilityView;

#[cfg(test)]
mod tests;
