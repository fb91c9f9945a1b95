//! Domain layer for prompt-relay
//!
//! This crate contains the value objects that travel through the relay and
//! the pure logic around them. It has no dependencies on brokers, engines or
//! presentation concerns.
//!
//! # Core Concepts
//!
//! - **Prompt**: user text plus a [`PromptId`] correlation token
//! - **AnswerFragment**: one numbered piece of the answer to a prompt; the
//!   last piece is flagged final
//! - **GenerationPhase**: per-message state machine of the generator
//! - **ReorderBuffer**: restores per-prompt fragment order on the relay side

pub mod answer;
pub mod core;
pub mod generation;
pub mod prompt;
pub mod queue;
pub mod util;
pub mod wire;

// Re-export commonly used types
pub use answer::{Admission, AnswerFragment, Eviction, ReorderBuffer};
pub use core::error::DomainError;
pub use generation::GenerationPhase;
pub use prompt::{Prompt, PromptId};
pub use queue::QueueOptions;
pub use wire::DecodedPrompt;
