//! Answer engines.

mod placeholder;

pub use placeholder::PlaceholderEngine;
