//! Generate Answers use case.
//!
//! Consumes prompts, asks the [`AnswerEngine`] for the answer, and publishes
//! the answer fragments in order onto the answer queue. Each prompt message
//! walks through [`GenerationPhase`]:
//!
//! 1. `Received` → `Generating`: start the engine
//! 2. `Publishing{n}`: publish fragment `n`; `is_final` only on the last one
//! 3. `Acknowledged`: ack the prompt once every fragment went out
//!
//! Engine or publish failures requeue the prompt, so the whole answer is
//! regenerated from sequence 0 on redelivery. A cancelled generation stops
//! publishing immediately, closes the answer with an empty final fragment
//! and acks the prompt.

use crate::config::{GeneratorParams, QueueTopology};
use crate::ports::answer_engine::{AnswerEngine, FragmentStream, GenerationError};
use crate::ports::broker::{BrokerError, Delivery};
use crate::session::BrokerSession;
use crate::use_cases::cancellation::CancellationRegistry;
use crate::use_cases::consume::{ConsumerStats, DeliveryHandler, run_consumer};
use async_trait::async_trait;
use futures::StreamExt;
use relay_domain::util::preview;
use relay_domain::wire::{decode_prompt, encode_fragment};
use relay_domain::{AnswerFragment, DomainError, GenerationPhase, Prompt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a generation pass did not complete.
#[derive(Error, Debug)]
pub enum GenerateAnswersError {
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// How one prompt message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// All fragments published, prompt acknowledged.
    Acknowledged { fragments: u64 },
    /// Generation failed after `published` fragments; prompt requeued.
    Requeued { published: u64 },
    /// Generation cancelled after `published` fragments; prompt acknowledged.
    Cancelled { published: u64 },
    /// Payload could not be decoded; prompt discarded.
    Rejected,
}

struct PassFailure {
    phase: GenerationPhase,
    error: GenerateAnswersError,
}

/// Use case for the answer generator worker.
pub struct GenerateAnswersUseCase {
    session: Arc<BrokerSession>,
    engine: Arc<dyn AnswerEngine>,
    topology: QueueTopology,
    params: GeneratorParams,
    cancellations: Arc<CancellationRegistry>,
}

impl GenerateAnswersUseCase {
    pub fn new(
        session: Arc<BrokerSession>,
        engine: Arc<dyn AnswerEngine>,
        topology: QueueTopology,
    ) -> Self {
        let params = GeneratorParams::default();
        let cancellations = Arc::new(CancellationRegistry::new(params.cancel_history));
        Self {
            session,
            engine,
            topology,
            params,
            cancellations,
        }
    }

    pub fn with_params(mut self, params: GeneratorParams) -> Self {
        self.params = params;
        self
    }

    /// Share a registry with a [`CancelListener`](super::cancellation::CancelListener).
    pub fn with_cancellations(mut self, registry: Arc<CancellationRegistry>) -> Self {
        self.cancellations = registry;
        self
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    /// Consume the prompt queue until `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<ConsumerStats, BrokerError> {
        info!(
            engine = self.engine.name(),
            prompts = %self.topology.prompt,
            answers = %self.topology.answer,
            "Answer generator started"
        );
        run_consumer(
            &self.session,
            &self.topology.prompt,
            &self.params.consumer,
            self,
            shutdown,
        )
        .await
    }

    /// Process one prompt delivery end to end and settle it.
    pub async fn process(&self, delivery: Delivery) -> Result<GenerationOutcome, BrokerError> {
        let decoded = match decode_prompt(delivery.payload()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(tag = delivery.delivery_tag(), "Rejecting prompt: {}", e);
                delivery.reject().await?;
                return Ok(GenerationOutcome::Rejected);
            }
        };
        if !decoded.is_correlated() {
            warn!(
                prompt_id = %decoded.prompt().id(),
                "Prompt without correlation token, answers carry a generated id"
            );
        }
        let prompt = decoded.into_prompt();

        info!(
            prompt_id = %prompt.id(),
            redelivered = delivery.redelivered(),
            "Prompt received: {}",
            preview(prompt.text(), 80)
        );

        let token = self.cancellations.begin(prompt.id());
        let result = self.generate_and_publish(&prompt, &token).await;
        self.cancellations.finish(prompt.id());

        match result {
            Ok(phase) => {
                let fragments = phase.published();
                if let Err(e) = phase.advance(GenerationPhase::Acknowledged) {
                    error!(prompt_id = %prompt.id(), "Refusing to acknowledge: {}", e);
                    delivery.requeue().await?;
                    return Ok(GenerationOutcome::Requeued {
                        published: fragments,
                    });
                }
                delivery.ack().await?;
                info!(prompt_id = %prompt.id(), fragments, "Prompt acknowledged");
                Ok(GenerationOutcome::Acknowledged { fragments })
            }
            Err(PassFailure {
                phase,
                error: GenerateAnswersError::Generation(GenerationError::Cancelled),
            }) => {
                let published = phase.published();
                // Close the answer so a waiting reader sees its end
                if let Err(e) = self.publish_terminal(&prompt, published).await {
                    warn!(prompt_id = %prompt.id(), "Could not close cancelled answer: {}", e);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tokio::time::sleep(self.params.failure_backoff).await;
                    delivery.requeue().await?;
                    return Ok(GenerationOutcome::Requeued { published });
                }
                delivery.ack().await?;
                info!(prompt_id = %prompt.id(), published, "Generation cancelled");
                Ok(GenerationOutcome::Cancelled { published })
            }
            Err(PassFailure { phase, error }) => {
                let published = phase.published();
                let transient =
                    matches!(&error, GenerateAnswersError::Broker(e) if e.is_transient());
                if transient {
                    warn!(
                        prompt_id = %prompt.id(),
                        published,
                        "Publish failed in phase {}, retrying on redelivery: {}",
                        phase,
                        error
                    );
                } else {
                    error!(
                        prompt_id = %prompt.id(),
                        published,
                        "Generation failed in phase {}: {}",
                        phase,
                        error
                    );
                }
                if let GenerateAnswersError::Broker(e) = &error
                    && e.is_fatal()
                {
                    return Err(e.clone());
                }
                tokio::time::sleep(self.params.failure_backoff).await;
                delivery.requeue().await?;
                Ok(GenerationOutcome::Requeued { published })
            }
        }
    }

    async fn generate_and_publish(
        &self,
        prompt: &Prompt,
        token: &CancellationToken,
    ) -> Result<GenerationPhase, PassFailure> {
        let mut phase = GenerationPhase::Received;
        let fail =
            |phase: GenerationPhase, error: GenerateAnswersError| PassFailure { phase, error };

        phase = phase
            .advance(GenerationPhase::Generating)
            .map_err(|e| fail(phase, e.into()))?;
        debug!(prompt_id = %prompt.id(), "Phase {}", phase);

        let mut stream = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(fail(phase, GenerationError::Cancelled.into())),
            started = self.engine.generate(prompt) => started.map_err(|e| fail(phase, e.into()))?,
        };

        phase = phase
            .advance(GenerationPhase::Publishing { next_sequence: 0 })
            .map_err(|e| fail(phase, e.into()))?;

        let mut pending = next_fragment(&mut stream, token)
            .await
            .map_err(|e| fail(phase, e.into()))?;
        if pending.is_none() {
            warn!(prompt_id = %prompt.id(), "Engine produced no fragments, sending empty answer");
            return self
                .publish(prompt, phase, String::new(), true)
                .await
                .map_err(|e| fail(phase, e));
        }

        while let Some(text) = pending.take() {
            // One fragment of look-ahead tells whether `text` is the last one
            let lookahead = next_fragment(&mut stream, token)
                .await
                .map_err(|e| fail(phase, e.into()));
            let lookahead = match lookahead {
                Ok(next) => next,
                Err(failure) => {
                    // The fragment already generated still goes out, unless
                    // the failure is a cancellation
                    if !matches!(
                        failure.error,
                        GenerateAnswersError::Generation(GenerationError::Cancelled)
                    ) {
                        phase = self
                            .publish(prompt, phase, text, false)
                            .await
                            .map_err(|e| fail(phase, e))?;
                    }
                    return Err(PassFailure { phase, ..failure });
                }
            };
            let is_final = lookahead.is_none();
            phase = self
                .publish(prompt, phase, text, is_final)
                .await
                .map_err(|e| fail(phase, e))?;
            pending = lookahead;
        }

        Ok(phase)
    }

    async fn publish(
        &self,
        prompt: &Prompt,
        phase: GenerationPhase,
        text: String,
        is_final: bool,
    ) -> Result<GenerationPhase, GenerateAnswersError> {
        let sequence = phase.published();
        let fragment = AnswerFragment::new(prompt.id().clone(), sequence, text, is_final);
        self.session
            .publish(&self.topology.answer, &encode_fragment(&fragment))
            .await?;
        debug!(prompt_id = %prompt.id(), sequence, is_final, "Fragment published");
        Ok(phase.advance(GenerationPhase::Publishing {
            next_sequence: sequence + 1,
        })?)
    }

    /// Publish the empty final fragment that ends a cancelled answer.
    ///
    /// When the relay already closed the prompt this is dropped there as a
    /// duplicate.
    async fn publish_terminal(&self, prompt: &Prompt, sequence: u64) -> Result<(), BrokerError> {
        let fragment = AnswerFragment::new(prompt.id().clone(), sequence, "", true);
        self.session
            .publish(&self.topology.answer, &encode_fragment(&fragment))
            .await?;
        debug!(prompt_id = %prompt.id(), sequence, "Cancelled answer closed");
        Ok(())
    }
}

/// Pull the next fragment text, giving up as soon as `token` is cancelled.
async fn next_fragment(
    stream: &mut FragmentStream,
    token: &CancellationToken,
) -> Result<Option<String>, GenerationError> {
    if token.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GenerationError::Cancelled),
        item = stream.next() => item.transpose(),
    }
}

#[async_trait]
impl DeliveryHandler for GenerateAnswersUseCase {
    async fn handle(&self, delivery: Delivery) -> Result<(), BrokerError> {
        self.process(delivery).await.map(|_| ())
    }
}
