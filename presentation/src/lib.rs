//! Presentation layer for prompt-relay
//!
//! This crate contains the CLI definitions and the console output used by
//! the relay when answers are shown in a terminal.

pub mod cli;
pub mod output;

// Re-export commonly used types
pub use cli::commands::{Cli, Command, SinkArg};
pub use output::console::{ConsoleAnswerSink, ConsoleFormatter};
