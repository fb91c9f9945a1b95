//! Prompts and their correlation tokens.

pub mod entities;

pub use entities::{Prompt, PromptId};
