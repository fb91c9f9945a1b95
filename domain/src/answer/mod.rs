//! Answer fragments and their per-prompt ordering.

pub mod fragment;
pub mod reorder;

pub use fragment::AnswerFragment;
pub use reorder::{Admission, Eviction, ReorderBuffer};
