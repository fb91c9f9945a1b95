//! Relay Answers use case.
//!
//! Consumes answer fragments and hands them to an [`AnswerSink`], keeping
//! per-prompt sequence order even when the broker redelivers out of order.
//!
//! A fragment is acknowledged only after the sink accepted it. Early
//! fragments are held unacknowledged in a [`ReorderBuffer`] until the gap in
//! front of them is filled; duplicates from redelivered generations are
//! acknowledged and dropped. When too many answers are open at once the
//! least recently active one is given up and its generation cancelled.

use crate::config::{QueueTopology, RelayParams};
use crate::ports::answer_sink::{AnswerSink, SinkError};
use crate::ports::broker::{BrokerError, Delivery};
use crate::session::BrokerSession;
use crate::use_cases::consume::{ConsumerStats, DeliveryHandler, run_consumer};
use async_trait::async_trait;
use relay_domain::wire::{decode_fragment, encode_cancel};
use relay_domain::{Admission, AnswerFragment, PromptId, ReorderBuffer};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How one fragment delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to the sink along with `drained` held successors.
    Forwarded { drained: usize },
    /// Ahead of the expected sequence; held unacknowledged.
    Held,
    /// Already forwarded or belongs to a closed prompt; acknowledged and dropped.
    Duplicate,
    /// Sink could not take it (or the buffer was full); requeued.
    Requeued,
    /// The client went away; the prompt was abandoned.
    Abandoned,
    /// Payload could not be decoded; discarded.
    Rejected,
}

/// Use case for the answer relay worker.
pub struct RelayAnswersUseCase {
    session: Arc<BrokerSession>,
    sink: Arc<dyn AnswerSink>,
    topology: QueueTopology,
    params: RelayParams,
    buffer: Mutex<ReorderBuffer<Delivery>>,
}

impl RelayAnswersUseCase {
    pub fn new(
        session: Arc<BrokerSession>,
        sink: Arc<dyn AnswerSink>,
        topology: QueueTopology,
    ) -> Self {
        Self::with_params(session, sink, topology, RelayParams::default())
    }

    pub fn with_params(
        session: Arc<BrokerSession>,
        sink: Arc<dyn AnswerSink>,
        topology: QueueTopology,
        params: RelayParams,
    ) -> Self {
        let buffer = ReorderBuffer::new(params.max_buffered_fragments, params.completed_history)
            .with_max_open_streams(params.max_open_streams);
        Self {
            session,
            sink,
            topology,
            params,
            buffer: Mutex::new(buffer),
        }
    }

    /// Consume the answer queue until `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<ConsumerStats, BrokerError> {
        info!(answers = %self.topology.answer, "Answer relay started");
        let stats = run_consumer(
            &self.session,
            &self.topology.answer,
            &self.params.consumer,
            self,
            shutdown,
        )
        .await?;
        // Held deliveries were never settled; dropping them returns them to
        // the queue once the channel closes
        let held = self.buffer.lock().await.drain_held();
        if !held.is_empty() {
            info!(held = held.len(), "Releasing held fragments on shutdown");
        }
        Ok(stats)
    }

    /// Prompts whose answer is still being relayed.
    pub async fn open_streams(&self) -> usize {
        self.buffer.lock().await.open_streams()
    }

    /// Handle one fragment delivery and settle it (or hold it).
    pub async fn process(&self, delivery: Delivery) -> Result<RelayOutcome, BrokerError> {
        let fragment = match decode_fragment(delivery.payload()) {
            Ok(fragment) => fragment,
            Err(e) => {
                error!(tag = delivery.delivery_tag(), "Rejecting answer: {}", e);
                delivery.reject().await?;
                return Ok(RelayOutcome::Rejected);
            }
        };

        let mut buffer = self.buffer.lock().await;
        if let Some(eviction) = buffer.make_room_for(&fragment.prompt_id) {
            warn!(
                prompt_id = %eviction.prompt_id,
                held = eviction.held.len(),
                "Too many open answers, giving up the idlest"
            );
            for (_, held) in eviction.held {
                held.ack().await?;
            }
            self.request_cancel(&eviction.prompt_id).await;
        }
        match buffer.admit(fragment, delivery) {
            Admission::Ready(fragment, delivery) => {
                self.forward(&mut buffer, fragment, delivery).await
            }
            Admission::Held => {
                debug!("Fragment held until the gap before it is filled");
                Ok(RelayOutcome::Held)
            }
            Admission::Duplicate(fragment, delivery) => {
                debug!(fragment = %fragment, "Dropping duplicate fragment");
                delivery.ack().await?;
                Ok(RelayOutcome::Duplicate)
            }
            Admission::Overflow(fragment, delivery) => {
                warn!(fragment = %fragment, "Reorder buffer full, requeueing");
                self.requeue_later(delivery).await?;
                Ok(RelayOutcome::Requeued)
            }
        }
    }

    /// Forward `fragment` and then every held successor that became ready.
    async fn forward(
        &self,
        buffer: &mut ReorderBuffer<Delivery>,
        fragment: AnswerFragment,
        delivery: Delivery,
    ) -> Result<RelayOutcome, BrokerError> {
        let prompt_id = fragment.prompt_id.clone();
        let mut next = Some((fragment, delivery));
        let mut forwarded = 0usize;

        while let Some((fragment, delivery)) = next.take() {
            match self.sink.deliver(&fragment).await {
                Ok(()) => {
                    // Commit before the ack: if the ack is lost, the
                    // redelivered copy is recognised as a duplicate
                    let stale = buffer.commit(&fragment);
                    delivery.ack().await?;
                    debug!(fragment = %fragment, "Fragment relayed");
                    for (old, held) in stale {
                        debug!(fragment = %old, "Dropping stale fragment of an earlier attempt");
                        held.ack().await?;
                    }
                    if fragment.is_final {
                        info!(
                            prompt_id = %prompt_id,
                            open_streams = buffer.open_streams(),
                            "Answer complete"
                        );
                    }
                    forwarded += 1;
                    next = buffer.take_ready(&prompt_id);
                }
                Err(SinkError::Unavailable(reason)) => {
                    warn!(fragment = %fragment, "Sink unavailable ({}), requeueing", reason);
                    self.requeue_later(delivery).await?;
                    return Ok(if forwarded == 0 {
                        RelayOutcome::Requeued
                    } else {
                        RelayOutcome::Forwarded {
                            drained: forwarded - 1,
                        }
                    });
                }
                Err(SinkError::Closed(_)) => {
                    self.abandon(buffer, &prompt_id, delivery).await?;
                    return Ok(RelayOutcome::Abandoned);
                }
            }
        }

        Ok(RelayOutcome::Forwarded {
            drained: forwarded.saturating_sub(1),
        })
    }

    async fn abandon(
        &self,
        buffer: &mut ReorderBuffer<Delivery>,
        prompt_id: &PromptId,
        delivery: Delivery,
    ) -> Result<(), BrokerError> {
        info!(prompt_id = %prompt_id, "Client gone, abandoning answer");
        delivery.ack().await?;
        for (_, held) in buffer.abandon(prompt_id) {
            held.ack().await?;
        }
        self.request_cancel(prompt_id).await;
        Ok(())
    }

    /// Tell every generator to stop working on `prompt_id`. Best effort.
    async fn request_cancel(&self, prompt_id: &PromptId) {
        if let Err(e) = self
            .session
            .broadcast(&self.topology.cancel_exchange, &encode_cancel(prompt_id))
            .await
        {
            warn!(prompt_id = %prompt_id, "Could not request cancellation: {}", e);
        }
    }

    async fn requeue_later(&self, delivery: Delivery) -> Result<(), BrokerError> {
        tokio::time::sleep(self.params.retry_delay).await;
        delivery.requeue().await
    }
}

#[async_trait]
impl DeliveryHandler for RelayAnswersUseCase {
    async fn handle(&self, delivery: Delivery) -> Result<(), BrokerError> {
        self.process(delivery).await.map(|_| ())
    }

    async fn on_channel_reset(&self) {
        let dropped = self.buffer.lock().await.drain_held();
        if !dropped.is_empty() {
            warn!(
                dropped = dropped.len(),
                "Dropped held fragments from the lost channel"
            );
        }
    }
}
