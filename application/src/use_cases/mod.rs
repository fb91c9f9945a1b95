//! Use cases
//!
//! Application-level operations that orchestrate domain logic.

pub mod cancellation;
pub mod consume;
pub mod generate_answers;
pub mod publish_prompt;
pub mod relay_answers;
