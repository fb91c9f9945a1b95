//! Generator-side lifecycle types.

pub mod phase;

pub use phase::GenerationPhase;
