//! Publish Prompt use case.
//!
//! Entry point for external callers (the HTTP layer, the CLI): turns prompt
//! text into a correlated [`Prompt`] and appends it to the prompt queue.
//! Publishing does not wait for the generator.

use crate::config::QueueTopology;
use crate::ports::broker::BrokerError;
use crate::session::BrokerSession;
use relay_domain::util::preview;
use relay_domain::wire::{encode_cancel, encode_prompt};
use relay_domain::{DomainError, Prompt, PromptId};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while publishing a prompt.
#[derive(Error, Debug)]
pub enum PublishPromptError {
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(#[from] DomainError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Use case for publishing prompts (and cancel requests for them).
#[derive(Clone)]
pub struct PublishPromptUseCase {
    session: Arc<BrokerSession>,
    topology: QueueTopology,
}

impl PublishPromptUseCase {
    pub fn new(session: Arc<BrokerSession>, topology: QueueTopology) -> Self {
        Self { session, topology }
    }

    /// Publish `text` to the prompt queue.
    ///
    /// When `correlation_id` is `None` a fresh token is generated. The token
    /// is returned either way; every answer fragment will carry it.
    pub async fn execute(
        &self,
        text: &str,
        correlation_id: Option<PromptId>,
    ) -> Result<PromptId, PublishPromptError> {
        let id = correlation_id.unwrap_or_else(PromptId::generate);
        let prompt = Prompt::try_new(id, text)?;

        self.session
            .publish(&self.topology.prompt, &encode_prompt(&prompt))
            .await?;

        info!(
            prompt_id = %prompt.id(),
            queue = %self.topology.prompt,
            "Prompt published: {}",
            preview(prompt.text(), 80)
        );
        Ok(prompt.id().clone())
    }

    /// Ask the generators to stop working on `prompt_id`. Every generator
    /// process receives the request; the one running the prompt acts on it.
    pub async fn request_cancel(&self, prompt_id: &PromptId) -> Result<(), PublishPromptError> {
        self.session
            .broadcast(&self.topology.cancel_exchange, &encode_cancel(prompt_id))
            .await?;
        info!(prompt_id = %prompt_id, "Cancel requested");
        Ok(())
    }
}
