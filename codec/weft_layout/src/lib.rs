//! The layout engine: shape codes in, field placements out.
//!
//! [`choices_to_code`] and [`code_to_layout`] are exact inverses over the
//! dense code space `0..multi_choice_count`; [`LayoutCache`] memoizes the
//! expensive direction.

mod cache;
mod code;

pub use cache::LayoutCache;
pub use code::{
    choices_to_code, choices_to_layout, code_bytes, code_from_bytes, code_to_layout, Layout,
    Placement,
};
