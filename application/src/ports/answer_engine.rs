//! Answer engine port
//!
//! The generation engine turns one prompt into a lazy, finite sequence of
//! answer texts. The placeholder engine and any real inference backend
//! implement the same trait, so the generator's state machine does not
//! change when the backend does.

use async_trait::async_trait;
use futures::stream::BoxStream;
use relay_domain::Prompt;
use thiserror::Error;

/// Errors raised by a generation engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Engine failed: {0}")]
    Engine(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Generation cancelled")]
    Cancelled,
}

/// Ordered answer texts for one prompt.
///
/// Consumed once: there is no way to rewind it, a retry means calling
/// [`AnswerEngine::generate`] again.
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

/// Generation engine
#[async_trait]
pub trait AnswerEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start generating the answer to `prompt`.
    async fn generate(&self, prompt: &Prompt) -> Result<FragmentStream, GenerationError>;
}
